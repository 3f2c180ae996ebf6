//! The player session controller.
//!
//! A long-lived coordinator around one MPRIS player: it attaches (to a
//! spawned child or an already-running bus name), mirrors the player's
//! playback state into a local clock, and drives bookmark loads and saves
//! as tracks change. Steady-state store or bus failures are logged and
//! survived; losing one save beats terminating playback management.
//!
//! The controller is generic over [`Bus`] so tests can drive it with a
//! scripted bus instead of a live session-bus connection.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;
use zbus::zvariant::ObjectPath;

use crate::bus::{Bus, Event, Properties, MPRIS_PREFIX, PLAYER_IFACE};
use crate::error::PbmError;
use crate::proc::{forward_signals, is_descendant, PlayerProcess};
use crate::store::{Bookmark, BookmarkStore};
use crate::xesam::XesamUrl;

/// How long attachment waits for the player to appear on the bus.
const ATTACH_TIMEOUT: Duration = Duration::from_secs(20);

/// Some players ignore a seek issued immediately after the track shows up.
const SETTLE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Playing,
    Paused,
    Stopped,
}

impl PlaybackStatus {
    fn parse(value: &str) -> Option<PlaybackStatus> {
        match value {
            "Playing" => Some(PlaybackStatus::Playing),
            "Paused" => Some(PlaybackStatus::Paused),
            "Stopped" => Some(PlaybackStatus::Stopped),
            _ => None,
        }
    }
}

/// The local playback clock: the last reported position plus wall time
/// elapsed since, counted only while the player reports Playing.
#[derive(Debug, Clone)]
pub struct PlaybackClock {
    status: PlaybackStatus,
    position_us: i64,
    position_at: Instant,
}

impl PlaybackClock {
    fn new() -> PlaybackClock {
        PlaybackClock {
            status: PlaybackStatus::Stopped,
            position_us: 0,
            position_at: Instant::now(),
        }
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status
    }

    pub fn set_position(&mut self, position_us: i64) {
        self.position_us = position_us;
        self.position_at = Instant::now();
    }

    pub fn current_position(&self) -> i64 {
        match self.status {
            PlaybackStatus::Playing => {
                self.position_us + self.position_at.elapsed().as_micros() as i64
            }
            _ => self.position_us,
        }
    }

    /// Apply a status change. Pausing deliberately leaves the anchor alone:
    /// `current_position` already stops advancing for anything but Playing.
    pub fn transition(&mut self, status: PlaybackStatus) {
        match status {
            PlaybackStatus::Playing => self.position_at = Instant::now(),
            PlaybackStatus::Paused => {}
            PlaybackStatus::Stopped => self.position_us = self.current_position(),
        }
        self.status = status;
    }
}

pub struct PlayerSession<'a, B: Bus> {
    store: &'a BookmarkStore,
    bus: B,
    child: Option<PlayerProcess>,
    resume_url: Option<XesamUrl>,
    bookmark: Option<Bookmark>,
    bus_name: Option<String>,
    name_owner: Option<String>,
    track_id: Option<String>,
    clock: PlaybackClock,
    forced_exit: Option<Arc<AtomicI32>>,
    attach_timeout: Duration,
}

impl<'a, B: Bus> PlayerSession<'a, B> {
    pub fn new(store: &'a BookmarkStore, bus: B) -> PlayerSession<'a, B> {
        PlayerSession {
            store,
            bus,
            child: None,
            resume_url: None,
            bookmark: None,
            bus_name: None,
            name_owner: None,
            track_id: None,
            clock: PlaybackClock::new(),
            forced_exit: None,
            attach_timeout: ATTACH_TIMEOUT,
        }
    }

    /// Arm the resume-url attachment criterion: a PropertiesChanged carrying
    /// this `xesam:url` counts as the player we spawned, even when the
    /// process handed off to a pre-existing bus instance.
    pub fn set_resume_url(&mut self, url: XesamUrl) {
        self.resume_url = Some(url);
    }

    pub fn bookmark(&self) -> Option<&Bookmark> {
        self.bookmark.as_ref()
    }

    /// Spawn the player command, attach to the bus name it claims, and
    /// manage bookmarks until the player goes away. Returns the exit code.
    pub async fn run(&mut self, cmd: &str) -> Result<i32, PbmError> {
        self.attach_spawned(cmd).await?;
        let pid = self.child.as_ref().map(PlayerProcess::pid);
        self.forced_exit = Some(forward_signals(pid, self.bus.event_sender()));
        self.run_steady().await
    }

    /// Attach to an already-running player and manage bookmarks until it
    /// goes away.
    pub async fn run_attached(&mut self, name: &str) -> Result<i32, PbmError> {
        self.attach_name(name).await?;
        self.forced_exit = Some(forward_signals(None, self.bus.event_sender()));
        self.run_steady().await
    }

    /// Attach to a player by well-known name without entering the steady
    /// loop; used by the save operation.
    pub async fn attach_name(&mut self, name: &str) -> Result<(), PbmError> {
        let name = if name.starts_with(MPRIS_PREFIX) {
            name.to_string()
        } else {
            format!("{MPRIS_PREFIX}{name}")
        };
        let owner = self.bus.get_name_owner(&name).await?;
        self.bus.watch_name_owners().await?;
        debug!("attached to player {name} (owner {owner})");
        self.bus_name = Some(name);
        self.name_owner = Some(owner);
        Ok(())
    }

    /// Read the player's properties and fetch or create the bookmark for
    /// its current url, without seeking. The clock absorbs the reported
    /// position and status so a following save lands on the live position.
    pub async fn ensure_bookmark(&mut self) -> Result<(), PbmError> {
        let name = self.attached_name().to_string();
        let props = self.bus.get_all_properties(&name).await?;

        let url = props
            .url
            .ok_or_else(|| PbmError::MissingProperty("player did not report a url".to_string()))?;
        let mut bookmark = self.store.get(&url)?;

        if let Some(track_id) = props.track_id {
            if !track_id.is_empty() {
                self.track_id = Some(track_id);
            }
        }
        if let Some(length) = props.length {
            bookmark.length = length;
        }
        if let Some(status) = props.status.as_deref().and_then(PlaybackStatus::parse) {
            self.clock.transition(status);
        }
        if let Some(position) = props.position {
            self.clock.set_position(position);
        }

        self.bookmark = Some(bookmark);
        Ok(())
    }

    /// Persist the current bookmark at the clock's position. A no-op when no
    /// track has been seen yet.
    pub fn update_bookmark(&mut self) -> Result<(), PbmError> {
        let Some(bookmark) = &mut self.bookmark else {
            debug!("no current bookmark to update");
            return Ok(());
        };
        let position = self.clock.current_position();
        debug!("saving bookmark at position {}", format_position(position));
        bookmark.position = position;
        bookmark.save(self.store)
    }

    fn attached_name(&self) -> &str {
        match &self.bus_name {
            Some(name) => name,
            None => unreachable!("controller used before attachment"),
        }
    }

    fn attached_owner(&self) -> &str {
        match &self.name_owner {
            Some(owner) => owner,
            None => unreachable!("controller used before attachment"),
        }
    }

    async fn attach_spawned(&mut self, cmd: &str) -> Result<(), PbmError> {
        self.bus.watch_name_owners().await?;
        self.bus.watch_mpris_properties().await?;

        let mut child = PlayerProcess::spawn(cmd)?;
        let child_pid = child.pid();
        let deadline = tokio::time::Instant::now() + self.attach_timeout;
        let mut child_running = true;

        let attached: Result<(String, String), PbmError> = loop {
            tokio::select! {
                event = self.bus.recv() => {
                    match event {
                        Some(Event::NameOwnerChanged { name, new_owner, .. }) => {
                            if !name.starts_with(MPRIS_PREFIX) || new_owner.is_empty() {
                                continue;
                            }
                            debug!("a player appeared: name: {name}, owner: {new_owner}");
                            let pid = match self.bus.get_unix_pid(&name).await {
                                Ok(pid) => pid,
                                Err(err) => {
                                    debug!("could not get process id for {name}: {err}");
                                    continue;
                                }
                            };
                            debug!("pid: {pid}");
                            if is_descendant(child_pid, pid) {
                                break Ok((name, new_owner));
                            }
                        }
                        Some(Event::PropertiesChanged { sender, interface, changed })
                            if interface == PLAYER_IFACE =>
                        {
                            let Some(resume) = &self.resume_url else { continue };
                            if changed.url.as_ref() != Some(resume) {
                                continue;
                            }
                            // The signal only carries the unique owner;
                            // recover the well-known name it belongs to.
                            match self.well_known_name_of(&sender).await {
                                Some(name) => break Ok((name, sender)),
                                None => debug!("no well-known name found for {sender}"),
                            }
                        }
                        Some(_) => {}
                        None => break Err(PbmError::BusClosed),
                    }
                }
                code = child.wait_exit(), if child_running => {
                    child_running = false;
                    if code == 0 && self.resume_url.is_some() {
                        debug!("player command exited cleanly, waiting for an existing player");
                    } else {
                        break Err(PbmError::player_cmd(
                            format!("player process exited unexpectedly (exit {code})"),
                            code,
                        ));
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    break Err(PbmError::player_cmd(
                        "timed out waiting for the player to appear on the bus",
                        1,
                    ));
                }
            }
        };

        let (name, owner) = attached?;
        let _ = self.bus.unwatch_mpris_properties().await;
        debug!("managing player {name} (owner {owner})");
        self.bus_name = Some(name);
        self.name_owner = Some(owner);
        self.child = Some(child);
        Ok(())
    }

    async fn well_known_name_of(&self, owner: &str) -> Option<String> {
        let names = match self.bus.list_player_names().await {
            Ok(names) => names,
            Err(err) => {
                debug!("could not list players: {err}");
                return None;
            }
        };
        for name in names {
            match self.bus.get_name_owner(&name).await {
                Ok(candidate) if candidate == owner => return Some(name),
                Ok(_) => {}
                Err(err) => debug!("could not resolve owner of {name}: {err}"),
            }
        }
        None
    }

    async fn run_steady(&mut self) -> Result<i32, PbmError> {
        let name = self.attached_name().to_string();
        let owner = self.attached_owner().to_string();

        let seed = self.bus.get_all_properties(&name).await?;
        self.sync(seed).await;
        self.bus.watch_player(&owner).await?;

        loop {
            let Some(event) = self.bus.recv().await else {
                debug!("bus connection closed, shutting down");
                break;
            };
            match event {
                Event::Seeked { sender, position } => {
                    if sender == owner {
                        debug!("handling seeked to {}", format_position(position));
                        self.clock.set_position(position);
                    }
                }
                Event::PropertiesChanged {
                    sender,
                    interface,
                    changed,
                } => {
                    if sender == owner && interface == PLAYER_IFACE {
                        self.sync(changed).await;
                    }
                }
                Event::Refetched { properties } => {
                    self.sync(properties).await;
                }
                Event::NameOwnerChanged {
                    name: changed_name,
                    new_owner,
                    ..
                } => {
                    if changed_name == name && new_owner != owner {
                        debug!("name owner changed from '{owner}' to '{new_owner}', shutting down");
                        break;
                    }
                }
                Event::Wakeup => {
                    debug!("woken up by the signal forwarder, shutting down");
                    break;
                }
            }
        }

        if let Err(err) = self.update_bookmark() {
            debug!("could not update bookmark: {err}");
        }

        if let Some(forced) = &self.forced_exit {
            let code = forced.load(Ordering::SeqCst);
            if code >= 0 {
                return Ok(code);
            }
        }
        match &mut self.child {
            Some(child) => Ok(child.wait_exit().await),
            None => Ok(0),
        }
    }

    /// Fold a set of reported properties into the controller state.
    async fn sync(&mut self, props: Properties) {
        let mut queue_refetch = false;

        if let Some(track_id) = props.track_id {
            if !track_id.is_empty() {
                self.track_id = Some(track_id);
            }
        }

        if let Some(url) = props.url {
            let changed = self.bookmark.as_ref().map_or(true, |b| b.url != url);
            if changed {
                debug!("url has changed to '{url}'");
                if let Err(err) = self.update_bookmark() {
                    debug!("could not update current bookmark: {err}");
                }
                if let Err(err) = self.load_bookmark(url).await {
                    debug!("could not load bookmark: {err}");
                }
                queue_refetch = true;
            }
        }

        if let Some(length) = props.length {
            if let Some(bookmark) = &mut self.bookmark {
                if bookmark.length != length {
                    debug!("setting track length to {}", format_position(length));
                    bookmark.length = length;
                }
            }
        }

        if let Some(status) = props.status.as_deref() {
            match PlaybackStatus::parse(status) {
                Some(next) if next != self.clock.status() => {
                    debug!(
                        "playback status changed from {:?} to {next:?}",
                        self.clock.status()
                    );
                    self.clock.transition(next);
                    queue_refetch = true;
                }
                Some(_) => {}
                None => debug!("player gave invalid status: {status}"),
            }
        }

        if let Some(position) = props.position {
            self.clock.set_position(position);
        }

        debug!(
            "current position: {}",
            format_position(self.clock.current_position())
        );

        if queue_refetch {
            // Many players send partial PropertiesChanged bodies and omit
            // Position on track changes; one follow-up GetAll fills the
            // gaps. Its result re-enters sync through the event channel.
            let name = self.attached_name().to_string();
            self.bus.spawn_refetch(name);
        }
    }

    async fn load_bookmark(&mut self, url: XesamUrl) -> Result<(), PbmError> {
        if self.bookmark.as_ref().is_some_and(|b| b.url == url) {
            debug!("url unchanged, not loading bookmark");
            return Ok(());
        }

        let bookmark = self.store.get(&url)?;

        if bookmark.exists() {
            debug!(
                "bookmark exists, syncing to position {}",
                format_position(bookmark.position)
            );
            tokio::time::sleep(SETTLE_DELAY).await;
            if let Err(err) = self.sync_position(bookmark.position).await {
                debug!("could not sync position: {err}");
            }
        } else {
            debug!("bookmark does not exist, not restoring");
        }

        self.bookmark = Some(bookmark);
        Ok(())
    }

    /// Seek the player to a saved position. Play is called first to force
    /// players out of their loading state, otherwise many ignore the seek.
    async fn sync_position(&mut self, position: i64) -> Result<(), PbmError> {
        let track_id = match &self.track_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => {
                return Err(PbmError::MissingProperty(
                    "player does not have a trackid".to_string(),
                ))
            }
        };
        let track_path = ObjectPath::try_from(track_id.as_str()).map_err(|_| {
            PbmError::MissingProperty(format!("player has an invalid trackid: '{track_id}'"))
        })?;

        let name = self.attached_name().to_string();
        debug!("syncing player position to {}", format_position(position));
        self.bus.play(&name).await?;
        self.bus.set_position(&name, &track_path, position).await?;
        self.clock.set_position(position);
        Ok(())
    }
}

/// Render microseconds as `M:SS`, or `H:MM:SS` past an hour.
pub fn format_position(us: i64) -> String {
    let seconds = (us / 1_000_000) % 60;
    let minutes = (us / 1_000_000 / 60) % 60;
    let hours = us / 1_000_000 / 60 / 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

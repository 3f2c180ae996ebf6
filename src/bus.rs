//! Session bus adapter.
//!
//! A thin layer over zbus: match management, one ordered channel of typed
//! signal events, property fetches and the few player-directed calls. The
//! controller never touches the wire format directly; property maps are
//! decoded into [`Properties`] before they leave this module. All
//! player-directed calls are flagged no-autostart so probing cannot launch
//! another player.

use std::collections::HashMap;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;
use zbus::fdo::DBusProxy;
use zbus::names::BusName;
use zbus::zvariant::{ObjectPath, OwnedValue, Value};
use zbus::{proxy, Connection, MatchRule, MessageStream};

use crate::error::PbmError;
use crate::xesam::XesamUrl;

pub const MPRIS_PREFIX: &str = "org.mpris.MediaPlayer2.";
pub const MPRIS_PATH: &str = "/org/mpris/MediaPlayer2";
pub const PLAYER_IFACE: &str = "org.mpris.MediaPlayer2.Player";

const DBUS_IFACE: &str = "org.freedesktop.DBus";
const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";

const EVENT_CAPACITY: usize = 32;

#[proxy(
    interface = "org.mpris.MediaPlayer2.Player",
    default_path = "/org/mpris/MediaPlayer2"
)]
trait MprisPlayer {
    #[zbus(no_autostart)]
    fn play(&self) -> zbus::Result<()>;

    #[zbus(no_autostart)]
    fn set_position(&self, track_id: &ObjectPath<'_>, position: i64) -> zbus::Result<()>;
}

#[proxy(
    interface = "org.freedesktop.DBus.Properties",
    default_path = "/org/mpris/MediaPlayer2"
)]
trait PlayerProperties {
    #[zbus(no_autostart)]
    fn get_all(&self, interface_name: &str) -> zbus::Result<HashMap<String, OwnedValue>>;
}

/// One entry on the listener's ordered event channel.
#[derive(Debug)]
pub enum Event {
    Seeked {
        sender: String,
        position: i64,
    },
    PropertiesChanged {
        sender: String,
        interface: String,
        changed: Properties,
    },
    NameOwnerChanged {
        name: String,
        old_owner: String,
        new_owner: String,
    },
    /// Result of a queued property refetch, re-entering the sync path.
    Refetched {
        properties: Properties,
    },
    /// Nil wake-up pushed by the signal forwarder.
    Wakeup,
}

/// The bus surface the session controller drives. [`BusListener`] is the
/// real session-bus implementation; tests substitute their own.
#[allow(async_fn_in_trait)]
pub trait Bus {
    /// Next event, in arrival order. `None` means the bus connection died.
    async fn recv(&mut self) -> Option<Event>;

    /// A producer handle onto the event channel, for the signal forwarder.
    fn event_sender(&self) -> mpsc::Sender<Event>;

    async fn watch_name_owners(&self) -> Result<(), PbmError>;

    /// Match PropertiesChanged on the MPRIS object path from any sender;
    /// used while attaching, before the player is known.
    async fn watch_mpris_properties(&self) -> Result<(), PbmError>;

    async fn unwatch_mpris_properties(&self) -> Result<(), PbmError>;

    /// Match every signal the attached player emits on its object path.
    async fn watch_player(&self, owner: &str) -> Result<(), PbmError>;

    async fn get_all_properties(&self, dest: &str) -> Result<Properties, PbmError>;

    /// Schedule one independent GetAll whose result re-enters the event
    /// channel as [`Event::Refetched`].
    fn spawn_refetch(&self, dest: String);

    async fn play(&self, dest: &str) -> Result<(), PbmError>;

    async fn set_position(
        &self,
        dest: &str,
        track_id: &ObjectPath<'_>,
        position: i64,
    ) -> Result<(), PbmError>;

    async fn get_name_owner(&self, name: &str) -> Result<String, PbmError>;

    async fn get_unix_pid(&self, name: &str) -> Result<u32, PbmError>;

    /// Running MPRIS players, as full well-known bus names.
    async fn list_player_names(&self) -> Result<Vec<String>, PbmError>;
}

pub struct BusListener {
    conn: Connection,
    dbus: DBusProxy<'static>,
    tx: mpsc::Sender<Event>,
    rx: mpsc::Receiver<Event>,
}

impl BusListener {
    pub async fn connect() -> Result<BusListener, PbmError> {
        let conn = Connection::session().await?;
        let dbus = DBusProxy::new(&conn).await?;
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        tokio::spawn(pump(MessageStream::from(&conn), tx.clone()));
        Ok(BusListener { conn, dbus, tx, rx })
    }
}

impl Bus for BusListener {
    async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    fn event_sender(&self) -> mpsc::Sender<Event> {
        self.tx.clone()
    }

    async fn watch_name_owners(&self) -> Result<(), PbmError> {
        self.dbus.add_match_rule(name_owner_changed_rule()?).await?;
        Ok(())
    }

    async fn watch_mpris_properties(&self) -> Result<(), PbmError> {
        self.dbus.add_match_rule(properties_changed_rule()?).await?;
        Ok(())
    }

    async fn unwatch_mpris_properties(&self) -> Result<(), PbmError> {
        self.dbus
            .remove_match_rule(properties_changed_rule()?)
            .await?;
        Ok(())
    }

    async fn watch_player(&self, owner: &str) -> Result<(), PbmError> {
        self.dbus.add_match_rule(player_rule(owner)?).await?;
        Ok(())
    }

    async fn get_all_properties(&self, dest: &str) -> Result<Properties, PbmError> {
        fetch_all(&self.conn, dest).await
    }

    fn spawn_refetch(&self, dest: String) {
        let conn = self.conn.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            match fetch_all(&conn, &dest).await {
                Ok(properties) => {
                    let _ = tx.send(Event::Refetched { properties }).await;
                }
                Err(err) => debug!("could not refetch properties: {err}"),
            }
        });
    }

    async fn play(&self, dest: &str) -> Result<(), PbmError> {
        let proxy = MprisPlayerProxy::builder(&self.conn)
            .destination(dest.to_string())?
            .build()
            .await?;
        proxy.play().await?;
        Ok(())
    }

    async fn set_position(
        &self,
        dest: &str,
        track_id: &ObjectPath<'_>,
        position: i64,
    ) -> Result<(), PbmError> {
        let proxy = MprisPlayerProxy::builder(&self.conn)
            .destination(dest.to_string())?
            .build()
            .await?;
        proxy.set_position(track_id, position).await?;
        Ok(())
    }

    async fn get_name_owner(&self, name: &str) -> Result<String, PbmError> {
        let owner = self.dbus.get_name_owner(BusName::try_from(name)?).await?;
        Ok(owner.to_string())
    }

    async fn get_unix_pid(&self, name: &str) -> Result<u32, PbmError> {
        let pid = self
            .dbus
            .get_connection_unix_process_id(BusName::try_from(name)?)
            .await?;
        Ok(pid)
    }

    async fn list_player_names(&self) -> Result<Vec<String>, PbmError> {
        let names = self.dbus.list_names().await?;
        Ok(names
            .into_iter()
            .map(|name| name.to_string())
            .filter(|name| name.starts_with(MPRIS_PREFIX))
            .collect())
    }
}

async fn fetch_all(conn: &Connection, dest: &str) -> Result<Properties, PbmError> {
    let proxy = PlayerPropertiesProxy::builder(conn)
        .destination(dest.to_string())?
        .build()
        .await?;
    Ok(Properties::decode(proxy.get_all(PLAYER_IFACE).await?))
}

fn name_owner_changed_rule() -> Result<MatchRule<'static>, PbmError> {
    Ok(MatchRule::builder()
        .msg_type(zbus::message::Type::Signal)
        .sender(DBUS_IFACE)?
        .interface(DBUS_IFACE)?
        .member("NameOwnerChanged")?
        .path("/org/freedesktop/DBus")?
        .build())
}

fn properties_changed_rule() -> Result<MatchRule<'static>, PbmError> {
    Ok(MatchRule::builder()
        .msg_type(zbus::message::Type::Signal)
        .interface(PROPERTIES_IFACE)?
        .member("PropertiesChanged")?
        .path(MPRIS_PATH)?
        .build())
}

fn player_rule(owner: &str) -> Result<MatchRule<'_>, PbmError> {
    Ok(MatchRule::builder()
        .msg_type(zbus::message::Type::Signal)
        .sender(owner)?
        .path(MPRIS_PATH)?
        .build())
}

async fn pump(mut stream: MessageStream, tx: mpsc::Sender<Event>) {
    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                debug!("dropping undecodable bus message: {err}");
                continue;
            }
        };

        let header = msg.header();
        let (Some(interface), Some(member)) = (header.interface(), header.member()) else {
            continue;
        };
        let sender = header
            .sender()
            .map(|name| name.to_string())
            .unwrap_or_default();

        let event = match (interface.as_str(), member.as_str()) {
            (DBUS_IFACE, "NameOwnerChanged") => {
                match msg.body().deserialize::<(String, String, String)>() {
                    Ok((name, old_owner, new_owner)) => Event::NameOwnerChanged {
                        name,
                        old_owner,
                        new_owner,
                    },
                    Err(err) => {
                        debug!("bad NameOwnerChanged body: {err}");
                        continue;
                    }
                }
            }
            (PROPERTIES_IFACE, "PropertiesChanged") => {
                if header.path().map(|p| p.as_str()) != Some(MPRIS_PATH) {
                    continue;
                }
                match msg
                    .body()
                    .deserialize::<(String, HashMap<String, OwnedValue>, Vec<String>)>()
                {
                    Ok((iface, changed, _invalidated)) => Event::PropertiesChanged {
                        sender,
                        interface: iface,
                        changed: Properties::decode(changed),
                    },
                    Err(err) => {
                        debug!("bad PropertiesChanged body: {err}");
                        continue;
                    }
                }
            }
            (PLAYER_IFACE, "Seeked") => match msg.body().deserialize::<i64>() {
                Ok(position) => Event::Seeked { sender, position },
                Err(err) => {
                    debug!("bad Seeked body: {err}");
                    continue;
                }
            },
            _ => continue,
        };

        if tx.send(event).await.is_err() {
            break;
        }
    }
}

/// The player properties the controller cares about, decoded from a
/// `GetAll` result or a `PropertiesChanged` body.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    pub position: Option<i64>,
    pub length: Option<i64>,
    pub track_id: Option<String>,
    pub url: Option<XesamUrl>,
    pub status: Option<String>,
}

fn as_i64(value: &OwnedValue) -> Option<i64> {
    match &**value {
        Value::I64(x) => Some(*x),
        _ => None,
    }
}

fn as_string(value: &OwnedValue) -> Option<String> {
    match &**value {
        Value::Str(s) => Some(s.to_string()),
        _ => None,
    }
}

fn as_track_id(value: &OwnedValue) -> Option<String> {
    match &**value {
        Value::ObjectPath(path) => Some(path.to_string()),
        // Some players ship the trackid as a plain string.
        Value::Str(s) => Some(s.to_string()),
        _ => None,
    }
}

impl Properties {
    pub fn decode(mut map: HashMap<String, OwnedValue>) -> Properties {
        let mut props = Properties::default();

        if let Some(value) = map.remove("Position") {
            props.position = as_i64(&value);
        }

        if let Some(value) = map.remove("Metadata") {
            match HashMap::<String, OwnedValue>::try_from(value) {
                Ok(metadata) => {
                    if let Some(value) = metadata.get("mpris:length") {
                        props.length = as_i64(value);
                    }
                    if let Some(value) = metadata.get("mpris:trackid") {
                        props.track_id = as_track_id(value);
                    }
                    if let Some(raw) = metadata.get("xesam:url").and_then(as_string) {
                        match XesamUrl::parse(&raw) {
                            Ok(url) => props.url = Some(url),
                            Err(err) => debug!("player gave invalid url '{raw}': {err}"),
                        }
                    }
                }
                Err(err) => debug!("player gave invalid metadata: {err}"),
            }
        }

        if let Some(value) = map.remove("PlaybackStatus") {
            props.status = as_string(&value);
        }

        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(value: Value<'_>) -> OwnedValue {
        OwnedValue::try_from(value).unwrap()
    }

    #[test]
    fn decodes_position_and_status() {
        let mut map = HashMap::new();
        map.insert("Position".to_string(), owned(Value::from(1_500_000_i64)));
        map.insert("PlaybackStatus".to_string(), owned(Value::from("Playing")));

        let props = Properties::decode(map);
        assert_eq!(props.position, Some(1_500_000));
        assert_eq!(props.status.as_deref(), Some("Playing"));
        assert!(props.url.is_none());
        assert!(props.track_id.is_none());
        assert!(props.length.is_none());
    }

    #[test]
    fn ignores_mistyped_values() {
        let mut map = HashMap::new();
        map.insert("Position".to_string(), owned(Value::from("oops")));

        let props = Properties::decode(map);
        assert!(props.position.is_none());
    }
}

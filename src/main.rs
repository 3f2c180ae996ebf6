//! playerbm: resume media playback where you left off, over MPRIS.
//!
//! - Spawns (or attaches to) a player on the D-Bus session bus and tracks
//!   the playing track through PropertiesChanged/Seeked signals.
//! - Persists one bookmark per media resource in an SQLite file under the
//!   XDG cache directory; file identity survives renames via inode/mtime
//!   and a content hash.
//! - Small operations list, delete and force-save bookmarks.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use tracing::debug;
use tracing_subscriber::EnvFilter;

mod bus;
mod cli;
mod error;
mod player;
mod proc;
mod store;
mod xesam;

use bus::{Bus, BusListener, MPRIS_PREFIX};
use cli::PbmCli;
use error::PbmError;
use player::{format_position, PlayerSession};
use store::BookmarkStore;
use xesam::{shell_quote, XesamUrl};

fn setup_logging() {
    let level = std::env::var("PBM_LOGLEVEL").unwrap_or_default();
    let directive = match level.to_uppercase().as_str() {
        "DEBUG" => "debug",
        "ERROR" => "error",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directive))
        .with_writer(std::io::stderr)
        .init();
}

fn db_path() -> Result<PathBuf, PbmError> {
    let cache = dirs::cache_dir().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "could not determine the XDG cache directory",
        )
    })?;
    let dir = cache.join("playerbm");
    std::fs::create_dir_all(&dir)?;
    Ok(dir.join("bookmarks.db"))
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(binary);
        if let Ok(meta) = std::fs::metadata(&candidate) {
            if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
                return Some(candidate);
            }
        }
    }
    None
}

fn list_bookmarks(store: &BookmarkStore) -> Result<i32, PbmError> {
    let bookmarks = store.list()?;
    if bookmarks.is_empty() {
        return Ok(0);
    }

    let home = std::env::var("HOME").unwrap_or_default();
    let mut urls = Vec::with_capacity(bookmarks.len());
    for bookmark in &bookmarks {
        let mut quoted = bookmark.url.shell_quoted();
        if !home.is_empty() && quoted.starts_with(&home) {
            quoted = quoted.replacen(&home, "~", 1);
        }
        urls.push(quoted);
    }
    let width = urls.iter().map(String::len).max().unwrap_or(0) + 2;

    eprintln!("{:<width$}{:<9}POSITION", "URL", "SHA256");
    for (bookmark, url) in bookmarks.iter().zip(&urls) {
        let hash = bookmark.hash.get(..7).unwrap_or(&bookmark.hash);
        let mut position = format_position(bookmark.position);
        if bookmark.length > 0 {
            position = format!("{position}/{}", format_position(bookmark.length));
        }
        println!("{url:<width$}{hash}  {position}");
    }

    Ok(0)
}

fn delete_bookmark(store: &BookmarkStore, url: &XesamUrl) -> Result<i32, PbmError> {
    let mut deleted = false;
    for mut bookmark in store.list()? {
        if bookmark.url == *url {
            bookmark.delete(store)?;
            deleted = true;
        }
    }
    if !deleted {
        eprintln!("no bookmark found for {url}");
        return Ok(1);
    }
    Ok(0)
}

async fn save_bookmarks(
    store: &BookmarkStore,
    bus: &BusListener,
    players: Option<&str>,
) -> Result<i32, PbmError> {
    let names: Vec<String> = match players {
        Some(list) => list
            .split(',')
            .filter(|name| !name.is_empty())
            .map(|name| {
                if name.starts_with(MPRIS_PREFIX) {
                    name.to_string()
                } else {
                    format!("{MPRIS_PREFIX}{name}")
                }
            })
            .collect(),
        None => bus.list_player_names().await?,
    };

    if names.is_empty() {
        println!("no players were found");
        return Ok(1);
    }

    for name in &names {
        let short = name.strip_prefix(MPRIS_PREFIX).unwrap_or(name);
        let bus = BusListener::connect().await?;
        let mut session = PlayerSession::new(store, bus);

        let prepared = match session.attach_name(name).await {
            Ok(()) => session.ensure_bookmark().await,
            Err(err) => Err(err),
        };
        if let Err(err) = prepared {
            println!("could not save bookmark for player {short}: {err}");
            continue;
        }

        session.update_bookmark()?;
        let position = session.bookmark().map(|b| b.position).unwrap_or(0);
        println!(
            "saved bookmark for player {short} to position {}",
            format_position(position)
        );
    }

    Ok(0)
}

async fn resume(
    store: &BookmarkStore,
    bus: BusListener,
    url: Option<XesamUrl>,
) -> Result<i32, PbmError> {
    let url = match url {
        Some(url) => url,
        None => match store.most_recent()? {
            Some(bookmark) => bookmark.url,
            None => {
                eprintln!("No recent unfinished bookmarks found");
                return Ok(0);
            }
        },
    };

    // A running player already on this url gets attached directly.
    let names = bus.list_player_names().await?;
    for name in names {
        let props = match bus.get_all_properties(&name).await {
            Ok(props) => props,
            Err(err) => {
                debug!("could not read properties of {name}: {err}");
                continue;
            }
        };
        if props.url.as_ref() == Some(&url) {
            debug!("resuming on running player {name}");
            let mut session = PlayerSession::new(store, bus);
            return session.run_attached(&name).await;
        }
    }

    let Some(xdg_open) = find_in_path("xdg-open") else {
        println!("Resuming requires xdg-open to be in the PATH (provided by xdg-utils)");
        return Ok(127);
    };
    let cmd = format!(
        "{} {}",
        shell_quote(&xdg_open.to_string_lossy()),
        url.shell_quoted()
    );

    let mut session = PlayerSession::new(store, bus);
    session.set_resume_url(url);
    session.run(&cmd).await
}

#[tokio::main]
async fn run(cli: PbmCli) -> Result<i32, PbmError> {
    if cli.help {
        print!("{}", cli::HELP);
        return Ok(0);
    }
    if cli.version {
        print!("{}", cli::version());
        return Ok(0);
    }

    let store = BookmarkStore::open(&db_path()?)?;

    if cli.list_bookmarks {
        return list_bookmarks(&store);
    }
    if let Some(url) = &cli.delete_url {
        return delete_bookmark(&store, url);
    }

    let bus = BusListener::connect().await?;

    if cli.list_players {
        for name in bus.list_player_names().await? {
            println!("{}", name.strip_prefix(MPRIS_PREFIX).unwrap_or(&name));
        }
        return Ok(0);
    }

    if cli.save {
        return save_bookmarks(&store, &bus, cli.save_players.as_deref()).await;
    }

    if cli.resume {
        return resume(&store, bus, cli.resume_url).await;
    }

    let Some(cmd) = &cli.player_cmd else {
        return Err(PbmError::Input("no player command given".to_string()));
    };
    let mut session = PlayerSession::new(&store, bus);
    session.run(cmd).await
}

fn main() {
    setup_logging();

    let args: Vec<String> = std::env::args().collect();
    let cli = match cli::parse_args(&args) {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("playerbm: {err}");
            std::process::exit(1);
        }
    };

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("playerbm: {err}");
            std::process::exit(err.exit_code());
        }
    }
}

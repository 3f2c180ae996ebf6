//! Persistent bookmark storage.
//!
//! One SQLite file maps a resource identity to its saved playback record.
//! File urls are identified with filesystem heuristics so the same media
//! survives renames and moves: try `(inode, mtime)` first to avoid reading
//! the file, then fall back to a streaming SHA-256 of the contents.

use std::fs::File;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::PbmError;
use crate::xesam::XesamUrl;

/// A bookmark within this many microseconds of the track length is
/// considered completed. 10 seconds.
const FINISHED_THRESHOLD: i64 = 10_000_000;

const SCHEMA: &str = "
CREATE TABLE bookmarks (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    url TEXT,
    position INTEGER,
    length INTEGER,
    hash TEXT,
    inode TEXT, -- u64 rendered as decimal
    mtime INTEGER,
    finished INTEGER, -- boolean
    created INTEGER,
    updated INTEGER
);
PRAGMA user_version = 1;
";

pub struct BookmarkStore {
    conn: Connection,
}

/// A saved playback record. `pending_create` is true until the first save
/// persists the row and assigns `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Bookmark {
    pub id: i64,
    pub url: XesamUrl,
    pub hash: String,
    pub inode: String,
    pub mtime: i64,
    pub position: i64,
    pub length: i64,
    pub finished: bool,
    pub created: i64,
    pub updated: i64,
    pending_create: bool,
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn sha256_file(path: &Path) -> Result<String, PbmError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

impl Bookmark {
    fn fresh(url: XesamUrl) -> Bookmark {
        Bookmark {
            id: 0,
            url,
            hash: String::new(),
            inode: String::new(),
            mtime: 0,
            position: 0,
            length: 0,
            finished: false,
            created: 0,
            updated: 0,
            pending_create: true,
        }
    }

    /// Whether this bookmark is already persisted.
    pub fn exists(&self) -> bool {
        !self.pending_create
    }

    /// Normalise and write the record. A position within
    /// [`FINISHED_THRESHOLD`] of a known length (or past it) marks the
    /// bookmark finished and rewinds it to the start; anything else clears
    /// the finished flag.
    pub fn save(&mut self, store: &BookmarkStore) -> Result<(), PbmError> {
        if self.length > 0
            && ((self.length - self.position).abs() < FINISHED_THRESHOLD
                || self.position > self.length)
        {
            self.finished = true;
            self.position = 0;
        } else {
            self.finished = false;
        }

        if self.pending_create {
            let stamp = now();
            store.conn.execute(
                "INSERT INTO bookmarks (url, position, hash, inode, mtime, length, finished,
                     created, updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    self.url.raw_string(),
                    self.position,
                    self.hash,
                    self.inode,
                    self.mtime,
                    self.length,
                    self.finished,
                    stamp,
                    stamp,
                ],
            )?;
            self.id = store.conn.last_insert_rowid();
            self.created = stamp;
            self.updated = stamp;
            self.pending_create = false;
        } else {
            let stamp = now();
            store.conn.execute(
                "UPDATE bookmarks
                 SET url = ?1, position = ?2, hash = ?3, inode = ?4, mtime = ?5, length = ?6,
                     finished = ?7, updated = ?8
                 WHERE id = ?9",
                params![
                    self.url.raw_string(),
                    self.position,
                    self.hash,
                    self.inode,
                    self.mtime,
                    self.length,
                    self.finished,
                    stamp,
                    self.id,
                ],
            )?;
            self.updated = stamp;
        }

        Ok(())
    }

    /// Remove the record. A no-op for bookmarks that were never persisted.
    pub fn delete(&mut self, store: &BookmarkStore) -> Result<(), PbmError> {
        if self.pending_create {
            return Ok(());
        }
        store
            .conn
            .execute("DELETE FROM bookmarks WHERE id = ?1", params![self.id])?;
        self.id = 0;
        self.pending_create = true;
        Ok(())
    }
}

impl BookmarkStore {
    pub fn open(path: &Path) -> Result<BookmarkStore, PbmError> {
        debug!("connecting to database at: {}", path.display());
        Self::init(Connection::open(path)?)
    }

    /// An in-memory store, used by tests.
    pub fn open_in_memory() -> Result<BookmarkStore, PbmError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<BookmarkStore, PbmError> {
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        debug!("database version: {version}");

        match version {
            0 => {
                debug!("initializing database for the first time");
                conn.execute_batch(SCHEMA)?;
            }
            1 => {}
            other => return Err(PbmError::UnknownSchemaVersion(other)),
        }

        Ok(BookmarkStore { conn })
    }

    /// Look up the bookmark for a resource, returning a fresh unsaved record
    /// when the identity is unknown.
    pub fn get(&self, url: &XesamUrl) -> Result<Bookmark, PbmError> {
        if url.scheme() == "file" {
            self.get_file_scheme(url)
        } else {
            self.get_other_scheme(url)
        }
    }

    fn get_file_scheme(&self, url: &XesamUrl) -> Result<Bookmark, PbmError> {
        debug!("getting bookmark from file scheme path");

        let path = url.path();
        let meta = std::fs::metadata(path)
            .map_err(|_| PbmError::NotARegularFile(path.to_path_buf()))?;
        if !meta.is_file() {
            return Err(PbmError::NotARegularFile(path.to_path_buf()));
        }

        let mut bookmark = Bookmark::fresh(url.clone());
        bookmark.inode = meta.ino().to_string();
        bookmark.mtime = meta.mtime() * 1_000_000_000 + meta.mtime_nsec();

        // First try: inode and mtime approximately identify a file without
        // reading it.
        let hit = self
            .conn
            .query_row(
                "SELECT id, position, hash, length, finished, updated, created
                 FROM bookmarks
                 WHERE inode = ?1 AND mtime = ?2
                 LIMIT 1",
                params![bookmark.inode, bookmark.mtime],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )
            .optional()?;

        if let Some((id, position, hash, length, finished, updated, created)) = hit {
            debug!("got bookmark from inode/mtime");
            bookmark.id = id;
            bookmark.position = position;
            bookmark.hash = hash;
            bookmark.length = length;
            bookmark.finished = finished;
            bookmark.updated = updated;
            bookmark.created = created;
            bookmark.pending_create = false;
            return Ok(bookmark);
        }

        // Second try: read the file and find it by content hash.
        bookmark.hash = sha256_file(path)?;

        let hit = self
            .conn
            .query_row(
                "SELECT id, position, length, finished, updated, created
                 FROM bookmarks
                 WHERE hash = ?1
                 LIMIT 1",
                params![bookmark.hash],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;

        match hit {
            Some((id, position, length, finished, updated, created)) => {
                debug!("got bookmark from hash");
                bookmark.id = id;
                bookmark.position = position;
                bookmark.length = length;
                bookmark.finished = finished;
                bookmark.updated = updated;
                bookmark.created = created;
                bookmark.pending_create = false;
            }
            None => {
                debug!("this is a new bookmark");
            }
        }

        Ok(bookmark)
    }

    fn get_other_scheme(&self, url: &XesamUrl) -> Result<Bookmark, PbmError> {
        let mut bookmark = Bookmark::fresh(url.clone());

        let hit = self
            .conn
            .query_row(
                "SELECT id, position, length, finished, updated, created
                 FROM bookmarks
                 WHERE url = ?1
                 LIMIT 1",
                params![url.raw_string()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;

        if let Some((id, position, length, finished, updated, created)) = hit {
            bookmark.id = id;
            bookmark.position = position;
            bookmark.length = length;
            bookmark.finished = finished;
            bookmark.updated = updated;
            bookmark.created = created;
            bookmark.pending_create = false;
        }

        Ok(bookmark)
    }

    /// All bookmarks, most recently updated first.
    pub fn list(&self) -> Result<Vec<Bookmark>, PbmError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, url, position, hash, inode, mtime, length, finished, updated, created
             FROM bookmarks
             ORDER BY updated DESC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, bool>(7)?,
                row.get::<_, i64>(8)?,
                row.get::<_, i64>(9)?,
            ))
        })?;

        let mut bookmarks = Vec::new();
        for row in rows {
            let (id, url, position, hash, inode, mtime, length, finished, updated, created) = row?;
            bookmarks.push(Bookmark {
                id,
                url: XesamUrl::parse(&url)?,
                hash,
                inode,
                mtime,
                position,
                length,
                finished,
                created,
                updated,
                pending_create: false,
            });
        }

        Ok(bookmarks)
    }

    /// The most recently updated unfinished bookmark, if any.
    pub fn most_recent(&self) -> Result<Option<Bookmark>, PbmError> {
        let hit = self
            .conn
            .query_row(
                "SELECT id, url, position, hash, inode, mtime, length, finished, updated, created
                 FROM bookmarks
                 WHERE finished = 0
                 ORDER BY updated DESC
                 LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, bool>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, i64>(9)?,
                    ))
                },
            )
            .optional()?;

        match hit {
            Some((id, url, position, hash, inode, mtime, length, finished, updated, created)) => {
                Ok(Some(Bookmark {
                    id,
                    url: XesamUrl::parse(&url)?,
                    hash,
                    inode,
                    mtime,
                    position,
                    length,
                    finished,
                    created,
                    updated,
                    pending_create: false,
                }))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn unique_media_file(dir: &Path, name: &str) -> XesamUrl {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        writeln!(
            file,
            "track-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        )
        .unwrap();
        XesamUrl::parse(path.to_str().unwrap()).unwrap()
    }

    #[test]
    fn get_save_get_keeps_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = BookmarkStore::open_in_memory().unwrap();
        let url = unique_media_file(dir.path(), "a.mp3");

        let mut bookmark = store.get(&url).unwrap();
        assert!(!bookmark.exists());
        assert_eq!(bookmark.hash.len(), 64);
        assert!(!bookmark.inode.is_empty());
        assert!(bookmark.mtime > 0);

        bookmark.save(&store).unwrap();
        assert!(bookmark.exists());
        assert!(bookmark.id > 0);
        assert!(bookmark.created > 0);
        assert!(bookmark.updated >= bookmark.created);

        bookmark.position = 1000;
        bookmark.length = 10_000_000_000;
        bookmark.save(&store).unwrap();

        let found = store.get(&url).unwrap();
        assert!(found.exists());
        assert_eq!(found.id, bookmark.id);
        assert_eq!(found.position, 1000);
        assert_eq!(found.length, 10_000_000_000);
    }

    #[test]
    fn finished_normalisation() {
        let dir = tempfile::tempdir().unwrap();
        let store = BookmarkStore::open_in_memory().unwrap();

        let mut bookmark = store.get(&unique_media_file(dir.path(), "a.mp3")).unwrap();
        bookmark.length = 10_000_000_000;
        bookmark.position = 9_999_000_001;
        bookmark.save(&store).unwrap();
        assert!(bookmark.finished);
        assert_eq!(bookmark.position, 0);

        bookmark.position = 5_000_000_000;
        bookmark.save(&store).unwrap();
        assert!(!bookmark.finished);
        assert_eq!(bookmark.position, 5_000_000_000);

        // Past the end also counts as finished.
        bookmark.position = 10_000_000_001;
        bookmark.save(&store).unwrap();
        assert!(bookmark.finished);
        assert_eq!(bookmark.position, 0);

        // With the length unknown, re-saving clears the flag.
        bookmark.length = 0;
        bookmark.position = 1_000_000;
        bookmark.save(&store).unwrap();
        assert!(!bookmark.finished);
    }

    #[test]
    fn most_recent_skips_finished() {
        let dir = tempfile::tempdir().unwrap();
        let store = BookmarkStore::open_in_memory().unwrap();

        let url_a = unique_media_file(dir.path(), "a.mp3");
        let mut a = store.get(&url_a).unwrap();
        a.save(&store).unwrap();

        // `updated` has second resolution.
        std::thread::sleep(std::time::Duration::from_millis(1100));

        let url_b = unique_media_file(dir.path(), "b.mp3");
        let mut b = store.get(&url_b).unwrap();
        b.save(&store).unwrap();

        let recent = store.most_recent().unwrap().unwrap();
        assert_eq!(recent.url, url_b);

        // Mark B finished directly; save() would rederive the flag.
        store
            .conn
            .execute(
                "UPDATE bookmarks SET finished = 1 WHERE id = ?1",
                params![b.id],
            )
            .unwrap();

        let recent = store.most_recent().unwrap().unwrap();
        assert_eq!(recent.url, url_a);
    }

    #[test]
    fn non_file_schemes_resolve_by_url() {
        let store = BookmarkStore::open_in_memory().unwrap();
        let url = XesamUrl::parse("http://example.com/x.mp4").unwrap();

        let mut bookmark = store.get(&url).unwrap();
        assert!(!bookmark.exists());
        assert!(bookmark.hash.is_empty());
        assert!(bookmark.inode.is_empty());

        bookmark.position = 42;
        bookmark.save(&store).unwrap();

        let found = store.get(&url).unwrap();
        assert!(found.exists());
        assert_eq!(found.id, bookmark.id);
        assert_eq!(found.position, 42);
        assert_eq!(found.url, url);
    }

    #[test]
    fn copied_file_is_found_by_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = BookmarkStore::open_in_memory().unwrap();

        let url = unique_media_file(dir.path(), "orig.mp3");
        let mut bookmark = store.get(&url).unwrap();
        bookmark.position = 2_000_000;
        bookmark.save(&store).unwrap();

        let copy = dir.path().join("copy.mp3");
        std::fs::copy(url.path(), &copy).unwrap();
        let copy_url = XesamUrl::parse(copy.to_str().unwrap()).unwrap();

        let found = store.get(&copy_url).unwrap();
        assert!(found.exists());
        assert_eq!(found.id, bookmark.id);
        assert_eq!(found.position, 2_000_000);
        assert_eq!(found.hash, bookmark.hash);
    }

    #[test]
    fn missing_or_irregular_files_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = BookmarkStore::open_in_memory().unwrap();

        let missing = XesamUrl::parse(dir.path().join("nope.mp3").to_str().unwrap()).unwrap();
        assert!(matches!(
            store.get(&missing),
            Err(PbmError::NotARegularFile(_))
        ));

        let dir_url = XesamUrl::parse(dir.path().to_str().unwrap()).unwrap();
        assert!(matches!(
            store.get(&dir_url),
            Err(PbmError::NotARegularFile(_))
        ));
    }

    #[test]
    fn delete_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = BookmarkStore::open_in_memory().unwrap();
        let url = unique_media_file(dir.path(), "a.mp3");

        let mut pending = store.get(&url).unwrap();
        pending.delete(&store).unwrap();

        let mut bookmark = store.get(&url).unwrap();
        bookmark.save(&store).unwrap();
        assert_eq!(store.list().unwrap().len(), 1);

        bookmark.delete(&store).unwrap();
        assert_eq!(bookmark.id, 0);
        assert!(!bookmark.exists());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn rejects_newer_schema_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bookmarks.db");

        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("PRAGMA user_version = 2;").unwrap();
        drop(conn);

        assert!(matches!(
            BookmarkStore::open(&path),
            Err(PbmError::UnknownSchemaVersion(2))
        ));
    }
}

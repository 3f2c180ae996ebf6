//! Command line scanning.
//!
//! Tokens are scanned left to right until the first non-flag token, which
//! begins the pass-through player command. String flags accept both
//! `--flag=VALUE` and a look-ahead `VALUE`; the look-ahead is only taken
//! when the next token does not start with `-`.

use crate::error::PbmError;
use crate::xesam::{shell_join, XesamUrl};

pub const HELP: &str = "\
playerbm [OPTION…] PLAYER_COMMAND

Description:
    playerbm is a utility that saves your place when you exit the player or
    change the track and automatically resumes from where you left off when
    you open it again.

    Pass the command to open your media player as PLAYER_COMMAND and playerbm
    will connect to the player over the MPRIS DBus Specification and begin
    managing bookmarks.

Example:
    playerbm player ~/audiobooks/war-and-peace.mp3

    Listen for awhile and close the player. When you open the player again
    with playerbm, it will seek to your last position.

Options:
   --list-bookmarks, -l  list all bookmarks and exit
   --list-players, -L    list all running players that can be controlled
   --resume[=URL], -r    launch a player and resume playing the given url, or
                         the most recently saved unfinished bookmark
   --save[=PLAYERS], -s  save bookmarks for the given comma-separated list of
                         players, or all running players
   --delete=URL, -d      delete the bookmark saved for URL
   --help, -h            show help
   --version, -v         print the version
";

pub fn version() -> String {
    format!("v{}\n", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Default)]
pub struct PbmCli {
    pub player_cmd: Option<String>,
    pub help: bool,
    pub version: bool,
    pub list_bookmarks: bool,
    pub list_players: bool,
    pub resume: bool,
    pub resume_url: Option<XesamUrl>,
    pub save: bool,
    pub save_players: Option<String>,
    pub delete_url: Option<XesamUrl>,
}

fn matches_flag(arg: &str, short: &str, long: &str) -> bool {
    arg == short
        || arg == long
        || arg.strip_prefix(short).and_then(|r| r.strip_prefix('=')).is_some()
        || arg.strip_prefix(long).and_then(|r| r.strip_prefix('=')).is_some()
}

fn inline_value(arg: &str) -> Option<&str> {
    arg.split_once('=').map(|(_, value)| value)
}

pub fn parse_args(args: &[String]) -> Result<PbmCli, PbmError> {
    tracing::debug!("parsing arguments: {args:?}");

    let mut cli = PbmCli::default();

    if args.len() == 1 {
        cli.help = true;
        return Ok(cli);
    }

    let mut i = 1;
    while i < args.len() {
        let arg = args[i].as_str();

        // A look-ahead value for string flags; only taken when the next
        // token is not itself a flag.
        let take_value = |i: &mut usize| -> Option<String> {
            if let Some(value) = inline_value(arg) {
                return Some(value.to_string());
            }
            match args.get(*i + 1) {
                Some(next) if !next.starts_with('-') => {
                    *i += 1;
                    Some(next.clone())
                }
                _ => None,
            }
        };

        match arg {
            "-h" | "--help" => cli.help = true,
            "-v" | "--version" => cli.version = true,
            "-l" | "--list-bookmarks" => cli.list_bookmarks = true,
            "-L" | "--list-players" => cli.list_players = true,
            _ if matches_flag(arg, "-s", "--save") => {
                cli.save = true;
                cli.save_players = take_value(&mut i);
            }
            _ if matches_flag(arg, "-r", "--resume") => {
                cli.resume = true;
                if let Some(value) = take_value(&mut i) {
                    cli.resume_url = Some(XesamUrl::parse(&value)?);
                }
            }
            _ if matches_flag(arg, "-d", "--delete") => {
                let value = take_value(&mut i)
                    .ok_or_else(|| PbmError::Input("--delete requires a URL".to_string()))?;
                cli.delete_url = Some(XesamUrl::parse(&value)?);
            }
            _ if arg.starts_with('-') => {
                return Err(PbmError::Input(format!("Unknown argument: {arg}")));
            }
            _ => {
                cli.player_cmd = Some(shell_join(&args[i..]));
                break;
            }
        }

        i += 1;
    }

    Ok(cli)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> PbmCli {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        parse_args(&args).unwrap()
    }

    #[test]
    fn no_arguments_means_help() {
        assert!(parse(&["playerbm"]).help);
    }

    #[test]
    fn boolean_flags() {
        assert!(parse(&["playerbm", "-h"]).help);
        assert!(parse(&["playerbm", "--help"]).help);
        assert!(parse(&["playerbm", "-v"]).version);
        assert!(parse(&["playerbm", "--version"]).version);
        assert!(parse(&["playerbm", "-l"]).list_bookmarks);
        assert!(parse(&["playerbm", "--list-bookmarks"]).list_bookmarks);
        assert!(parse(&["playerbm", "-L"]).list_players);
        assert!(parse(&["playerbm", "--list-players"]).list_players);
    }

    #[test]
    fn save_value_forms() {
        let cli = parse(&["playerbm", "-s"]);
        assert!(cli.save);
        assert_eq!(cli.save_players, None);

        for args in [
            &["playerbm", "--save", "mpv"][..],
            &["playerbm", "-s", "mpv"][..],
            &["playerbm", "--save=mpv"][..],
            &["playerbm", "-s=mpv"][..],
        ] {
            let cli = parse(args);
            assert!(cli.save);
            assert_eq!(cli.save_players.as_deref(), Some("mpv"));
        }
    }

    #[test]
    fn no_look_ahead_into_flags() {
        let cli = parse(&["playerbm", "-s", "-l"]);
        assert!(cli.save);
        assert_eq!(cli.save_players, None);
        assert!(cli.list_bookmarks);
    }

    #[test]
    fn resume_url() {
        let cli = parse(&["playerbm", "-r"]);
        assert!(cli.resume);
        assert!(cli.resume_url.is_none());

        let cli = parse(&["playerbm", "--resume", "/tmp/file.mp3"]);
        assert!(cli.resume);
        assert_eq!(
            cli.resume_url.unwrap().raw_string(),
            "file:///tmp/file.mp3"
        );
    }

    #[test]
    fn delete_requires_a_url() {
        let cli = parse(&["playerbm", "--delete=file:///tmp/a.mp3"]);
        assert_eq!(cli.delete_url.unwrap().raw_string(), "file:///tmp/a.mp3");

        let args = vec!["playerbm".to_string(), "-d".to_string()];
        assert!(parse_args(&args).is_err());
    }

    #[test]
    fn unknown_flags_are_errors() {
        let args = vec!["playerbm".to_string(), "--bogus".to_string()];
        assert!(parse_args(&args).is_err());
    }

    #[test]
    fn player_command_is_joined_verbatim() {
        let cli = parse(&["playerbm", "mpv", "/tmp/a b.mp3"]);
        assert_eq!(cli.player_cmd.as_deref(), Some("mpv '/tmp/a b.mp3'"));

        // Tokens after the first non-flag are never parsed as flags.
        let cli = parse(&["playerbm", "mpv", "--shuffle"]);
        assert_eq!(cli.player_cmd.as_deref(), Some("mpv --shuffle"));
    }
}

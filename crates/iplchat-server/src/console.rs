//! Operator console: a line-oriented command loop over stdin with a fixed
//! command table and edit-distance suggestions for near-miss input.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::warn;

use iplchat_store::Store;

use crate::config::ServerConfig;
use crate::session::SessionRegistry;

/// An entered command is only matched to a known one when the minimum edit
/// distance stays within this bound.
const MAX_SUGGEST_DISTANCE: usize = 3;

pub struct ConsoleCommand {
    pub name: &'static str,
    pub description: &'static str,
    pub usage: &'static str,
    pub arity: usize,
}

pub const COMMANDS: &[ConsoleCommand] = &[
    ConsoleCommand {
        name: "help",
        description: "List the available commands",
        usage: "help",
        arity: 0,
    },
    ConsoleCommand {
        name: "stop",
        description: "Flush pending writes and shut the broker down",
        usage: "stop",
        arity: 0,
    },
    ConsoleCommand {
        name: "clear",
        description: "Clear the console",
        usage: "clear",
        arity: 0,
    },
    ConsoleCommand {
        name: "clients",
        description: "List connected sessions",
        usage: "clients",
        arity: 0,
    },
    ConsoleCommand {
        name: "snapshot",
        description: "Save a snapshot of the database",
        usage: "snapshot",
        arity: 0,
    },
    ConsoleCommand {
        name: "snapshot-load",
        description: "Replace the live database with a named snapshot",
        usage: "snapshot-load <name>",
        arity: 1,
    },
    ConsoleCommand {
        name: "snapshot-revert",
        description: "Undo the most recent snapshot load",
        usage: "snapshot-revert",
        arity: 0,
    },
    ConsoleCommand {
        name: "snapshot-list",
        description: "List snapshots, oldest first",
        usage: "snapshot-list",
        arity: 0,
    },
    ConsoleCommand {
        name: "log",
        description: "Show where log output goes",
        usage: "log",
        arity: 0,
    },
    ConsoleCommand {
        name: "config",
        description: "Show the active configuration",
        usage: "config",
        arity: 0,
    },
    ConsoleCommand {
        name: "license",
        description: "Show license information",
        usage: "license",
        arity: 0,
    },
];

/// Levenshtein distance, two-row formulation.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// The known command closest to `input`, when close enough to suggest.
pub fn suggest(input: &str) -> Option<&'static str> {
    COMMANDS
        .iter()
        .map(|c| (c.name, edit_distance(input, c.name)))
        .min_by_key(|(_, d)| *d)
        .filter(|(_, d)| *d <= MAX_SUGGEST_DISTANCE)
        .map(|(name, _)| name)
}

pub struct Console {
    store: Arc<Store>,
    registry: Arc<SessionRegistry>,
    config: ServerConfig,
    config_path: PathBuf,
    shutdown: watch::Sender<bool>,
}

impl Console {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<SessionRegistry>,
        config: ServerConfig,
        config_path: PathBuf,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            config_path,
            shutdown,
        }
    }

    /// Read commands until `stop` or stdin closes.
    pub async fn run(self) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("iplchat broker console — type 'help' for commands");

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "console input failed");
                    break;
                }
            };
            if !self.execute(&line) {
                break;
            }
        }
        let _ = self.shutdown.send(true);
    }

    /// Execute one input line. Returns `false` when the loop should stop.
    fn execute(&self, line: &str) -> bool {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((&name, args)) = tokens.split_first() else {
            return true;
        };

        let Some(command) = COMMANDS.iter().find(|c| c.name == name) else {
            match suggest(name) {
                Some(nearest) => println!("unknown command '{name}', did you mean '{nearest}'?"),
                None => println!("unknown command '{name}'"),
            }
            return true;
        };
        if args.len() != command.arity {
            println!("usage: {}", command.usage);
            return true;
        }

        match command.name {
            "help" => {
                for c in COMMANDS {
                    println!("  {:<18} {}", c.usage, c.description);
                }
            }
            "stop" => {
                println!("shutting down");
                return false;
            }
            "clear" => print!("\x1b[2J\x1b[1;1H"),
            "clients" => {
                let clients = self.registry.client_list();
                if clients.is_empty() {
                    println!("no connected clients");
                }
                for (id, username, addr) in clients {
                    let user = username.unwrap_or_else(|| "<unauthenticated>".to_owned());
                    println!("  #{id:<6} {user:<24} {addr}");
                }
            }
            "snapshot" => match self.store.save_snapshot() {
                Ok(name) => println!("snapshot saved: {name}"),
                Err(e) => println!("snapshot failed: {e}"),
            },
            "snapshot-load" => match self.store.load_snapshot(args[0]) {
                Ok(()) => println!("snapshot loaded: {}", args[0]),
                Err(e) => println!("snapshot load failed: {e}"),
            },
            "snapshot-revert" => match self.store.revert_snapshot_load() {
                Ok(()) => println!("snapshot load reverted"),
                Err(e) => println!("revert failed: {e}"),
            },
            "snapshot-list" => {
                let snapshots = self.store.list_snapshots();
                if snapshots.is_empty() {
                    println!("no snapshots");
                }
                for name in snapshots {
                    println!("  {name}");
                }
            }
            "log" => match &self.config.logfile_path {
                Some(path) => println!(
                    "logging to {} (verbose: {})",
                    path.display(),
                    self.config.log_verbose
                ),
                None => println!("logging to stdout (verbose: {})", self.config.log_verbose),
            },
            "config" => {
                println!("config file: {}", self.config_path.display());
                print!("{}", self.config.to_file_string());
            }
            "license" => {
                println!("iplchat broker — GNU Affero General Public License v3.0");
                println!("This is free software: you may redistribute it under the AGPL-3.0 terms.");
            }
            _ => unreachable!("command table covers every name"),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_distance_basics() {
        assert_eq!(edit_distance("", ""), 0);
        assert_eq!(edit_distance("stop", "stop"), 0);
        assert_eq!(edit_distance("stop", "stip"), 1);
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("", "help"), 4);
    }

    #[test]
    fn test_suggest_within_three_edits() {
        assert_eq!(suggest("stpo"), Some("stop"));
        assert_eq!(suggest("clints"), Some("clients"));
        assert_eq!(suggest("snapshotlist"), Some("snapshot-list"));
    }

    #[test]
    fn test_no_suggestion_beyond_three_edits() {
        // At least four edits away from every command.
        assert_eq!(suggest("xylophone"), None);
        assert!(COMMANDS.iter().all(|c| edit_distance("xylophone", c.name) >= 4));
    }
}

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "parley", version, about = "Parley: batched conversational agent gateway")]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Commands {
    /// Run the gateway on the terminal channel.
    Start {
        /// Conversation for lines without a `group:`/`dm:` prefix.
        #[arg(long, default_value = "dm:local")]
        conversation: String,

        /// Sender for lines without a `name:` prefix.
        #[arg(long, default_value = "you")]
        sender: String,
    },
    /// Print the most recent turns of a conversation.
    Turns {
        /// Conversation key, e.g. `group:friends`.
        key: String,

        #[arg(short = 'n', long, default_value = "5")]
        limit: usize,
    },
    /// Print the recent chat transcript of a conversation.
    ChatLog {
        key: String,

        /// Window size in minutes (1..=1440).
        #[arg(short, long)]
        minutes: Option<u32>,
    },
    /// Validate the config file and open the database.
    Check,
    Version,
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_turns_with_limit() {
        let cli = Cli::parse_from(["parley", "-c", "p.toml", "turns", "group:g1", "-n", "3"]);
        assert_eq!(cli.config.as_deref(), Some("p.toml"));
        match cli.command {
            Commands::Turns { key, limit } => {
                assert_eq!(key, "group:g1");
                assert_eq!(limit, 3);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn chat_log_subcommand_is_kebab_case() {
        let cli = Cli::parse_from(["parley", "chat-log", "dm:alice", "--minutes", "90"]);
        assert!(matches!(
            cli.command,
            Commands::ChatLog { minutes: Some(90), .. }
        ));
    }

    #[test]
    fn start_has_terminal_defaults() {
        let cli = Cli::try_parse_from(["parley", "start"]).unwrap();
        match cli.command {
            Commands::Start {
                conversation,
                sender,
            } => {
                assert_eq!(conversation, "dm:local");
                assert_eq!(sender, "you");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}

//! CLI command definitions

use crate::settlement::OutcomeKind;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ballbet")]
#[command(about = "Ballbet - two-party item negotiation and settlement", long_about = None)]
pub struct Cli {
    /// JSON configuration file (defaults apply to missing fields)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the confirmation cooldown, in seconds
    #[arg(long, global = true)]
    pub cooldown: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a complete negotiation between two players against an in-memory store
    Simulate {
        /// How proposals are settled
        #[arg(short, long, value_enum, default_value = "winner-takes-all")]
        outcome: OutcomeArg,

        /// Seed for the winner draw
        #[arg(short, long)]
        seed: Option<u64>,

        /// Items each player puts on the table
        #[arg(short, long, default_value = "3")]
        items: usize,

        /// Make every ownership write for this item id fail
        #[arg(long)]
        fail_item: Option<u64>,
    },

    /// Replay a JSON script of negotiation actions
    Replay {
        /// Path to the script
        script: PathBuf,

        /// Settlement outcome, unless the script sets one
        #[arg(short, long, value_enum)]
        outcome: Option<OutcomeArg>,

        /// Seed for the winner draw, unless the script sets one
        #[arg(short, long)]
        seed: Option<u64>,
    },

    /// Print the effective configuration
    Config,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutcomeArg {
    Swap,
    WinnerTakesAll,
}

impl From<OutcomeArg> for OutcomeKind {
    fn from(arg: OutcomeArg) -> Self {
        match arg {
            OutcomeArg::Swap => OutcomeKind::Swap,
            OutcomeArg::WinnerTakesAll => OutcomeKind::WinnerTakesAll,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simulate() {
        let cli = Cli::try_parse_from([
            "ballbet",
            "simulate",
            "--outcome",
            "swap",
            "--seed",
            "7",
            "--fail-item",
            "3",
        ])
        .unwrap();

        match cli.command {
            Commands::Simulate {
                outcome,
                seed,
                items,
                fail_item,
            } => {
                assert_eq!(outcome, OutcomeArg::Swap);
                assert_eq!(seed, Some(7));
                assert_eq!(items, 3);
                assert_eq!(fail_item, Some(3));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let cli =
            Cli::try_parse_from(["ballbet", "config", "--config", "ballbet.json", "--cooldown", "0"])
                .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("ballbet.json")));
        assert_eq!(cli.cooldown, Some(0));
        assert!(matches!(cli.command, Commands::Config));
    }

    #[test]
    fn test_outcome_conversion() {
        assert_eq!(OutcomeKind::from(OutcomeArg::WinnerTakesAll), OutcomeKind::WinnerTakesAll);
    }
}

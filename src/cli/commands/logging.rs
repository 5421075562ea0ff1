//! Log verbosity: repeated `-v` flags or `CLIENTELE_LOG_LEVEL`.

use clap::{Arg, ArgAction, ArgMatches, Command, builder::ValueParser};
use tracing::Level;

pub const ARG_VERBOSITY: &str = "verbosity";

/// Indexed by verbosity count; anything past the end logs everything.
const LEVELS: [Level; 5] = [
    Level::ERROR,
    Level::WARN,
    Level::INFO,
    Level::DEBUG,
    Level::TRACE,
];

// The env value is stored as a count so it lines up with `-vvv`.
fn verbosity_parser() -> ValueParser {
    ValueParser::from(|raw: &str| -> Result<u8, String> {
        let raw = raw.trim();
        if let Ok(count) = raw.parse::<u8>() {
            return Ok(count);
        }
        raw.parse::<Level>()
            .ok()
            .and_then(|level| LEVELS.iter().position(|known| *known == level))
            .and_then(|index| u8::try_from(index).ok())
            .ok_or_else(|| {
                format!("invalid log level {raw:?}, expected one of error, warn, info, debug, trace")
            })
    })
}

/// Level the subscriber starts from. `RUST_LOG` directives still apply on top.
#[must_use]
pub fn level(matches: &ArgMatches) -> Level {
    let count = matches.get_one::<u8>(ARG_VERBOSITY).copied().unwrap_or(0);
    LEVELS
        .get(usize::from(count))
        .copied()
        .unwrap_or(Level::TRACE)
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command.arg(
        Arg::new(ARG_VERBOSITY)
            .short('v')
            .long("verbose")
            .help("Log more: -v warn, -vv info, -vvv debug, -vvvv trace (default: error)")
            .env("CLIENTELE_LOG_LEVEL")
            .global(true)
            .action(ArgAction::Count)
            .value_parser(verbosity_parser()),
    )
}

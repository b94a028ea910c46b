//! Board profile listing and lookup.

use {
    crate::{Cli, CliError, config::Config},
    anyhow::Result,
    console::style,
    log::debug,
    stkflash::{BoardProfile, Protocol},
};

/// Board used when neither `--board` nor the config names one.
pub(crate) const DEFAULT_BOARD: &str = "uno";

/// Resolve the board from `--board`, the config, or the default.
pub(crate) fn resolve_board(cli: &Cli, config: &Config) -> Result<BoardProfile> {
    let query = match cli.board.as_deref().or(config.upload.board.as_deref()) {
        Some(query) => query,
        None => {
            debug!("No board given, assuming {DEFAULT_BOARD}");
            DEFAULT_BOARD
        },
    };
    config.find_board(query).ok_or_else(|| {
        CliError::Usage(format!(
            "Unknown board '{query}'. Run `stkflash boards` to list known boards"
        ))
        .into()
    })
}

fn baud_list(board: &BoardProfile) -> String {
    board
        .baud_rates
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Boards command implementation.
pub(crate) fn cmd_boards(config: &Config, json: bool) -> Result<()> {
    let boards = config.all_boards();

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "boards": boards,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Board profiles").bold().underlined());
    for board in &boards {
        let custom = config.boards.iter().any(|b| b.id == board.id);
        let note = match (board.protocol, custom) {
            (Protocol::Stk500v2, _) => format!(" {}", style("(stk500v2, not supported)").red()),
            (_, true) => format!(" {}", style("(custom)").magenta()),
            _ => String::new(),
        };
        eprintln!(
            "  {} {:<12} {}{}",
            style("•").green(),
            style(&board.id).cyan().bold(),
            board.name,
            note
        );
        eprintln!(
            "      {} baud, {}-byte pages{}",
            baud_list(board),
            board.page_size,
            board
                .fqbn
                .as_deref()
                .map(|f| format!(", {}", style(f).dim()))
                .unwrap_or_default()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, clap::Parser};

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_resolve_board_precedence() {
        let mut config = Config::default();
        config.upload.board = Some("nano".to_string());

        let board = resolve_board(&cli(&["stkflash", "--board", "pro-mini", "boards"]), &config).unwrap();
        assert_eq!(board.id, "pro-mini");

        let board = resolve_board(&cli(&["stkflash", "boards"]), &config).unwrap();
        assert_eq!(board.id, "nano");

        let board = resolve_board(&cli(&["stkflash", "boards"]), &Config::default()).unwrap();
        assert_eq!(board.id, DEFAULT_BOARD);
    }

    #[test]
    fn test_resolve_unknown_board_is_usage_error() {
        let err = resolve_board(&cli(&["stkflash", "--board", "esp32", "boards"]), &Config::default())
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_))));
        assert!(err.to_string().contains("esp32"));
    }

    #[test]
    fn test_baud_list() {
        let board = BoardProfile::find("nano").unwrap();
        assert_eq!(baud_list(&board), "115200, 57600");
    }
}

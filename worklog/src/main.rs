use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use worklog::config::WorklogConfig;
use worklog::core::{BlockKind, Direction, HeaderQuery, LevelFilter};
use worklog::editor::{Buffer, LineIndex};
use worklog::{Session, header_info_from_line, parse_blocks};

#[derive(Debug, Parser)]
#[command(
    name = "worklog",
    about = "Markdown worklog tooling: TODO states, header navigation, DONE sorting",
    version
)]
struct Cli {
    /// Enable debug logging on stderr (RUST_LOG takes precedence).
    #[arg(long, global = true)]
    verbose: bool,
    /// JSON settings file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Write a CLOSED timestamp when a header becomes DONE.
    #[arg(long, global = true, conflicts_with = "no_timestamps")]
    timestamps: bool,
    /// Never write CLOSED timestamps, whatever the config says.
    #[arg(long, global = true)]
    no_timestamps: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse a worklog and print its blocks.
    Parse(ParseArgs),

    /// Find the nearest header matching a query.
    Find(FindArgs),

    /// Resolve a header navigation command from a cursor line.
    Goto(GotoArgs),

    /// Cycle the TODO state of the header governing a line.
    Todo(TodoArgs),

    /// Move DONE sections below unfinished ones.
    Sort(SortArgs),

    /// Print the fenced code block under a line.
    Codeblock(CodeblockArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    file: PathBuf,
    /// Emit JSON instead of a line-per-block listing.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FindArgs {
    file: PathBuf,
    /// Zero-based line to search from.
    #[arg(long)]
    line: usize,
    #[arg(long)]
    backward: bool,
    /// Allow a header on the starting line itself.
    #[arg(long)]
    include_current: bool,
    #[arg(long, conflicts_with = "exact_level")]
    min_level: Option<u8>,
    #[arg(long)]
    exact_level: Option<u8>,
    /// Inclusive lower line bound.
    #[arg(long)]
    lower: Option<usize>,
    /// Inclusive upper line bound.
    #[arg(long)]
    upper: Option<usize>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum GotoTarget {
    Next,
    Previous,
    NextSibling,
    PreviousSibling,
    Parent,
}

#[derive(Debug, Args)]
struct GotoArgs {
    #[arg(value_enum)]
    target: GotoTarget,
    file: PathBuf,
    #[arg(long)]
    line: usize,
}

#[derive(Debug, Args)]
struct TodoArgs {
    file: PathBuf,
    #[arg(long)]
    line: usize,
    /// Step backwards through the cycle.
    #[arg(long)]
    decrease: bool,
    /// Print the planned edits as JSON without applying them.
    #[arg(long, conflicts_with = "in_place")]
    plan: bool,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct SortArgs {
    file: PathBuf,
    /// Only sort the sections under the header governing this line.
    #[arg(long)]
    line: Option<usize>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct CodeblockArgs {
    file: PathBuf,
    #[arg(long)]
    line: usize,
    /// Print the selectable range instead of the block body.
    #[arg(long)]
    range: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = resolve_config(cli.config.as_deref(), cli.timestamps, cli.no_timestamps)?;
    debug!(?config, "resolved settings");
    match cli.command {
        Commands::Parse(args) => handle_parse(args),
        Commands::Find(args) => handle_find(args, config),
        Commands::Goto(args) => handle_goto(args, config),
        Commands::Todo(args) => handle_todo(args, config),
        Commands::Sort(args) => handle_sort(args, config),
        Commands::Codeblock(args) => handle_codeblock(args, config),
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn resolve_config(
    path: Option<&Path>,
    timestamps: bool,
    no_timestamps: bool,
) -> Result<WorklogConfig> {
    let mut config = match path {
        Some(path) => WorklogConfig::load(path)?,
        None => WorklogConfig::default(),
    };
    if timestamps {
        config = config.with_timestamps(true);
    }
    if no_timestamps {
        config = config.with_timestamps(false);
    }
    Ok(config)
}

fn read_document(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {:?}", path))
}

fn open_session(path: &Path, line: usize, config: WorklogConfig) -> Result<Session<Buffer>> {
    let text = read_document(path)?;
    Ok(Session::new(Buffer::new(text).with_cursor_line(line), config))
}

fn finish_document(path: &Path, session: Session<Buffer>, in_place: bool) -> Result<()> {
    let text = session
        .into_editor()
        .map(Buffer::into_text)
        .context("session lost its document")?;
    if in_place {
        fs::write(path, text.as_bytes()).with_context(|| format!("writing {:?}", path))?;
    } else {
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn handle_parse(args: ParseArgs) -> Result<()> {
    let ParseArgs { file, json } = args;
    let text = read_document(&file)?;
    let blocks = parse_blocks(&text);
    debug!(path = ?file, blocks = blocks.len(), "parsed document");

    if json {
        println!("{}", serde_json::to_string_pretty(&blocks)?);
        return Ok(());
    }

    let index = LineIndex::new(&text);
    for block in &blocks {
        let indent = "  ".repeat(block.nesting_depth);
        let lines = format!("{}-{}", block.span.start, block.span.end);
        match &block.kind {
            BlockKind::Heading { level } => {
                let state = index
                    .line(block.span.start)
                    .map(|line| header_info_from_line(line).todo_state)
                    .unwrap_or_default();
                println!("{lines:>9} {indent}h{level} {state}");
            }
            BlockKind::Fence { info, closed, .. } => {
                let suffix = if *closed { "" } else { " (unterminated)" };
                println!("{lines:>9} {indent}fence {info}{suffix}");
            }
            BlockKind::Other => println!("{lines:>9} {indent}other"),
        }
    }
    Ok(())
}

fn handle_find(args: FindArgs, config: WorklogConfig) -> Result<()> {
    let FindArgs {
        file,
        line,
        backward,
        include_current,
        min_level,
        exact_level,
        lower,
        upper,
    } = args;
    let level = match (exact_level, min_level) {
        (Some(exact), _) => LevelFilter::Exactly(exact),
        (None, Some(min)) => LevelFilter::AtLeast(min),
        (None, None) => LevelFilter::Any,
    };
    let direction = if backward {
        Direction::Backward
    } else {
        Direction::Forward
    };
    let mut query = HeaderQuery::new(direction, line)
        .with_level(level)
        .within(lower, upper);
    query.include_from_line = include_current;

    let session = open_session(&file, line, config)?;
    match session.find_header(&query)? {
        Some(found) => println!("{found}"),
        None => eprintln!("No matching header."),
    }
    Ok(())
}

fn handle_goto(args: GotoArgs, config: WorklogConfig) -> Result<()> {
    let GotoArgs { target, file, line } = args;
    let mut session = open_session(&file, line, config)?;
    let found = match target {
        GotoTarget::Next => session.goto_next_header()?,
        GotoTarget::Previous => session.goto_previous_header()?,
        GotoTarget::NextSibling => session.goto_next_sibling()?,
        GotoTarget::PreviousSibling => session.goto_previous_sibling()?,
        GotoTarget::Parent => session.goto_parent_header()?,
    };
    match found {
        Some(found) => println!("{found}"),
        None => eprintln!("No header to go to from line {line}."),
    }
    Ok(())
}

fn handle_todo(args: TodoArgs, config: WorklogConfig) -> Result<()> {
    let TodoArgs {
        file,
        line,
        decrease,
        plan,
        in_place,
    } = args;
    let delta = if decrease { -1 } else { 1 };
    let now = Local::now().naive_local();
    let mut session = open_session(&file, line, config)?;

    if plan {
        match session.plan_todo_change(delta, now)? {
            Some(change) => println!("{}", serde_json::to_string_pretty(&change)?),
            None => eprintln!("No header above line {line}."),
        }
        return Ok(());
    }

    if session.change_todo(delta, now)?.is_none() {
        eprintln!("No header above line {line}; document unchanged.");
    }
    finish_document(&file, session, in_place)
}

fn handle_sort(args: SortArgs, config: WorklogConfig) -> Result<()> {
    let SortArgs {
        file,
        line,
        in_place,
    } = args;
    let mut session = open_session(&file, line.unwrap_or(0), config)?;
    let moved = match line {
        Some(_) => session.sort_current_section()?,
        None => session.sort_done_to_bottom()?,
    };
    debug!(path = ?file, moved, "sorted DONE sections");
    finish_document(&file, session, in_place)
}

fn handle_codeblock(args: CodeblockArgs, config: WorklogConfig) -> Result<()> {
    let CodeblockArgs { file, line, range } = args;
    let mut session = open_session(&file, line, config)?;
    if range {
        match session.select_current_codeblock()? {
            Some(selected) => println!(
                "{}:{}-{}:{}",
                selected.start.line,
                selected.start.character,
                selected.end.line,
                selected.end.character
            ),
            None => eprintln!("No code block at line {line}."),
        }
        return Ok(());
    }
    match session.copy_current_codeblock()? {
        Some(body) => print!("{body}"),
        None => eprintln!("No code block at line {line}."),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn cli_flags_override_config_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("worklog.json");
        fs::write(&path, r#"{ "insert_closed_timestamp": true }"#).expect("write config");

        let loaded = resolve_config(Some(&path), false, false).expect("resolve");
        assert!(loaded.insert_closed_timestamp);

        let disabled = resolve_config(Some(&path), false, true).expect("resolve");
        assert!(!disabled.insert_closed_timestamp);

        let enabled = resolve_config(None, true, false).expect("resolve");
        assert!(enabled.insert_closed_timestamp);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = resolve_config(Some(&tmp.path().join("absent.json")), false, false)
            .expect_err("missing file");
        assert!(format!("{err:#}").contains("absent.json"));
    }

    #[test]
    fn todo_in_place_rewrites_the_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("log.md");
        fs::write(&path, "# TODO ship it\nnotes\n").expect("write log");

        handle_todo(
            TodoArgs {
                file: path.clone(),
                line: 1,
                decrease: false,
                plan: false,
                in_place: true,
            },
            WorklogConfig::default(),
        )
        .expect("todo");

        assert_eq!(
            fs::read_to_string(&path).expect("read log"),
            "# DONE ship it\nnotes\n"
        );
    }

    #[test]
    fn todo_plan_leaves_the_file_alone() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("log.md");
        fs::write(&path, "# TODO ship it\n").expect("write log");

        handle_todo(
            TodoArgs {
                file: path.clone(),
                line: 0,
                decrease: true,
                plan: true,
                in_place: false,
            },
            WorklogConfig::default().with_timestamps(true),
        )
        .expect("todo");

        assert_eq!(fs::read_to_string(&path).expect("read log"), "# TODO ship it\n");
    }

    #[test]
    fn sort_in_place_sinks_done_sections() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("log.md");
        fs::write(&path, "# DONE old\nx\n# TODO new\ny\n").expect("write log");

        handle_sort(
            SortArgs {
                file: path.clone(),
                line: None,
                in_place: true,
            },
            WorklogConfig::default(),
        )
        .expect("sort");

        assert_eq!(
            fs::read_to_string(&path).expect("read log"),
            "# TODO new\ny\n# DONE old\nx\n"
        );
    }

    #[test]
    fn out_of_range_line_is_reported() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("log.md");
        fs::write(&path, "# TODO a\n").expect("write log");

        let err = handle_goto(
            GotoArgs {
                target: GotoTarget::Next,
                file: path,
                line: 40,
            },
            WorklogConfig::default(),
        )
        .expect_err("cursor out of bounds");
        assert!(err.to_string().contains("outside the document"));
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}

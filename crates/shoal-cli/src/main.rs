use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

use shoal_core::exit;
use shoal_runner::execute_suite;
use shoal_select::{SelectOptions, TagsConfig, TestKind};
use shoal_suite::{RunConfig, Suite};

#[derive(Parser)]
#[command(
    name = "shoal",
    version,
    about = "Suite-based test runner for sharded database clusters"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Select and run the tests of a suite
    Run(RunArgs),
    /// Print the tags each tag file attaches to test patterns
    ListTags(ListTagsArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Suite YAML file
    #[arg(long)]
    suite: PathBuf,
    /// Explicit test identifiers; these replace the suite's roots
    tests: Vec<String>,
    /// Select and report, but run nothing
    #[arg(long)]
    dry_run: bool,
    /// Shuffle the selected tests before execution
    #[arg(long)]
    shuffle: bool,
    /// Seed for shuffling and workload grouping
    #[arg(long)]
    seed: Option<u64>,
    /// Extra tag file layered after the suite's own (repeatable)
    #[arg(long = "tag-file")]
    tag_files: Vec<String>,
    /// Extra tag that force-includes matching tests (repeatable)
    #[arg(long = "include-with-any-tags")]
    include_with_any_tags: Vec<String>,
    /// Extra tag that excludes matching tests (repeatable)
    #[arg(long = "exclude-with-any-tags")]
    exclude_with_any_tags: Vec<String>,
    /// Database shell used for JS tests and script-backed hooks
    #[arg(long, default_value = "mongo")]
    shell: PathBuf,
    /// First port handed to fixture processes
    #[arg(long, default_value_t = 20000)]
    base_port: u16,
    /// Override the suite's shard count
    #[arg(long)]
    num_shards: Option<usize>,
    /// Task identifier embedded in archive filenames
    #[arg(long, default_value = "local")]
    task: String,
    /// Execution (retry) number embedded in archive filenames
    #[arg(long, default_value_t = 0)]
    execution: u32,
    /// Archive every result regardless of the suite's archive config
    #[arg(long)]
    archive_all: bool,
    /// Local directory archives are written under
    #[arg(long, default_value = "archive")]
    archive_dir: PathBuf,
}

#[derive(Args)]
struct ListTagsArgs {
    /// Tag files to read (repeatable)
    #[arg(long = "tag-file", required = true)]
    tag_files: Vec<PathBuf>,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run(args) => run_suite(args),
        Command::ListTags(args) => list_tags(&args.tag_files),
    };
    std::process::exit(code);
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_suite(args: RunArgs) -> i32 {
    let run = RunConfig {
        shell: args.shell,
        dry_run: args.dry_run,
        shuffle: args.shuffle,
        seed: args.seed,
        task: args.task,
        execution: args.execution,
        archive_all: args.archive_all,
        archive_dir: args.archive_dir,
        base_port: args.base_port,
        num_shards: args.num_shards,
        select: SelectOptions {
            cli_test_files: args.tests,
            include_with_any_tags: args.include_with_any_tags,
            exclude_with_any_tags: args.exclude_with_any_tags,
            tag_files: args.tag_files,
            shuffle_seed: args.seed,
            ..SelectOptions::default()
        },
    };

    let result = Suite::from_file(&args.suite).and_then(|suite| {
        tracing::info!(target: "shoal::cli", suite = %suite.name(), "running suite");
        execute_suite(&suite, &run)
    });

    match result {
        Ok(summary) => {
            println!(
                "{} passed, {} failed, {} errored in {:.1?}",
                summary.passed, summary.failed, summary.errored, summary.duration
            );
            if summary.all_passed() {
                exit::SUCCESS
            } else {
                exit::TEST_FAILURE
            }
        }
        Err(err) => {
            eprintln!("{err}");
            exit::code_for(&err)
        }
    }
}

fn list_tags(tag_files: &[PathBuf]) -> i32 {
    for path in tag_files {
        let config = match TagsConfig::from_file(Path::new(path)) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("{err}");
                return exit::CONFIG_ERROR;
            }
        };
        println!("{}:", path.display());
        for kind in TestKind::ALL {
            let patterns = config.get_test_patterns(kind.as_str());
            if patterns.is_empty() {
                continue;
            }
            println!("  {kind}:");
            for pattern in patterns {
                let tags = config.get_tags(kind.as_str(), &pattern);
                println!("    {pattern}: {}", tags.join(", "));
            }
        }
    }
    exit::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::parse_from([
            "shoal",
            "run",
            "--suite",
            "suites/core_sharded.yml",
            "--dry-run",
            "--shuffle",
            "--seed",
            "42",
            "--num-shards",
            "3",
            "--exclude-with-any-tags",
            "requires_standalone",
            "jstests/core/a.js",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run subcommand");
        };
        assert!(args.dry_run);
        assert!(args.shuffle);
        assert_eq!(args.seed, Some(42));
        assert_eq!(args.num_shards, Some(3));
        assert_eq!(args.tests, vec!["jstests/core/a.js"]);
        assert_eq!(args.exclude_with_any_tags, vec!["requires_standalone"]);
    }
}

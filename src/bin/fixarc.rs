use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};
use console::style;
use fixarc::{
    Archive, ArchiveError, CancelToken, CopyOptions, FrameRange, Metadata, ProjectFile, Report,
    VerifyMode, print_summary,
};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::{Layer as _, SubscriberExt as _};
use tracing_subscriber::util::SubscriberInitExt as _;

#[derive(Parser, Debug)]
#[command(name = "fixarc", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Archive a script together with every file it depends on.
    Archive(ArchiveArgs),
}

#[derive(Args, Debug)]
struct ArchiveArgs {
    /// Project file to archive.
    script: Utf8PathBuf,

    /// Directory the archive tree is created under.
    #[arg(long)]
    archive_root: Utf8PathBuf,

    #[arg(long)]
    vendor: Option<String>,

    #[arg(long)]
    show: Option<String>,

    /// Omitted from archive paths when not given.
    #[arg(long)]
    season: Option<String>,

    #[arg(long)]
    episode: Option<String>,

    #[arg(long)]
    shot: Option<String>,

    /// Output node to archive; repeat for several. Defaults to every enabled write node.
    #[arg(long = "target")]
    targets: Vec<String>,

    /// Replace gizmos with the nodes they are made of.
    #[arg(long)]
    bake_gizmos: bool,

    /// Gizmos defined under this directory are never baked.
    #[arg(long = "native-root")]
    native_roots: Vec<Utf8PathBuf>,

    /// Point file knobs of the archived script at the archived files.
    #[arg(long)]
    update_script: bool,

    /// Frames to collect for every sequence, `A-B` or `A`.
    #[arg(long, allow_hyphen_values = true)]
    frame_range: Option<FrameRange>,

    /// Also archive files rendered by write nodes.
    #[arg(long)]
    include_renders: bool,

    /// Where to write the JSON report.
    #[arg(long)]
    report: Option<Utf8PathBuf>,

    /// Run everything except copying files and saving the script.
    #[arg(long)]
    dry_run: bool,

    /// Number of directories copied at the same time.
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Attempts per file, the first one included.
    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// How copied files are checked.
    #[arg(long, value_enum, default_value_t = VerifyChoice::Size)]
    verify: VerifyChoice,

    /// `-v` for progress details, `-vv` for debugging.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum VerifyChoice {
    Exists,
    Size,
    Checksum,
}

impl From<VerifyChoice> for VerifyMode {
    fn from(choice: VerifyChoice) -> Self {
        match choice {
            VerifyChoice::Exists => VerifyMode::Exists,
            VerifyChoice::Size => VerifyMode::Size,
            VerifyChoice::Checksum => VerifyMode::Checksum,
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    match cli.cmd {
        Command::Archive(args) => cmd_archive(args),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // progress bars are drawn regardless of the log level
    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(indicatif_layer.get_stderr_writer())
                .with_filter(filter),
        )
        .with(indicatif_layer)
        .init();
}

/// Cancels `cancel` on the first Ctrl-C.
fn watch_interrupt(cancel: CancelToken) {
    thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                tracing::warn!(%err, "couldn't listen for interrupts");
                return;
            }
        };

        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{}", style("Interrupted, stopping copies...").yellow());
                cancel.cancel();
            }
        });
    });
}

fn cmd_archive(args: ArchiveArgs) -> anyhow::Result<ExitCode> {
    init_logging(args.verbose);

    let metadata = Metadata {
        vendor: args.vendor.unwrap_or_default(),
        show: args.show.unwrap_or_default(),
        season: args.season,
        episode: args.episode.unwrap_or_default(),
        shot: args.shot.unwrap_or_default(),
    };

    let copy = CopyOptions {
        concurrency: args.concurrency,
        max_attempts: args.retries,
        backoff: Duration::from_millis(500),
        verify: args.verify.into(),
    };

    let mut config = Archive::config()
        .archive_root(args.archive_root)
        .metadata(metadata)
        .targets(args.targets)
        .bake_gizmos(args.bake_gizmos)
        .update_script(args.update_script)
        .include_renders(args.include_renders)
        .dry_run(args.dry_run)
        .copy_options(copy);
    if let Some(range) = args.frame_range {
        config = config.frame_range(range);
    }
    for root in args.native_roots {
        config = config.native_root(root);
    }

    let result = config.finish().and_then(|archive| {
        watch_interrupt(archive.cancel_token());
        let project = ProjectFile::open(args.script.clone()).map_err(ArchiveError::from)?;
        archive.run(&project)
    });

    let report = match result {
        Ok(report) => report,
        Err(err) => {
            tracing::error!(%err, "archive aborted");
            Report::aborted(&err, &[])
        }
    };

    if let Some(path) = &args.report {
        report
            .write_json(path)
            .with_context(|| format!("write report '{path}'"))?;
    }

    print_summary(&report);

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

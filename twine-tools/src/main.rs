use std::path::{Path, PathBuf};
use std::sync::mpsc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use notify::{RecursiveMode, Watcher};
use tracing_subscriber::EnvFilter;
use twine_publisher::{
    serialize_twee3, story_stats, FormatLoader, LoadState, PublishMode, PublishOptions, Publisher, Story,
};

mod config;
mod input;

use config::Config;
use input::{file_stem, glob_paths, read_stories, read_story, write_file, Error};

/// Publishes Twine stories through story formats
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Configuration file. Defaults to twine.toml in the current directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Additional glob pattern for story format files. Can be repeated
    #[arg(long = "format-path", global = true)]
    format_paths: Vec<String>,

    /// Time limit for loading a story format, in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct PublishArgs {
    /// The story to publish (.twee, .tw, .html or .json)
    story: PathBuf,
    /// The file to write. Defaults to <story name>.html in the output directory
    #[arg(short, long)]
    out: Option<PathBuf>,
    /// Name of the passage to start at instead of the story's start passage
    #[arg(long)]
    start: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Publishes a playable story
    Publish(PublishArgs),
    /// Publishes a story with the story format's debugging aids turned on
    Test(PublishArgs),
    /// Publishes a story through the proofing format
    Proof(PublishArgs),
    /// Bundles stories into a Twine archive
    Archive {
        /// Story files or glob patterns
        #[arg(required = true)]
        stories: Vec<String>,
        /// The archive file to write
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Prints word counts and broken links
    Stats {
        story: PathBuf,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Unpacks a Twine HTML archive into .twee files
    Unpack {
        /// The file to unpack
        file: PathBuf,
        /// The directory to create the .twee files in
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
    /// Publishes a story again whenever its file changes
    Watch {
        #[command(flatten)]
        args: PublishArgs,
        /// Publish in test mode
        #[arg(long)]
        test: bool,
    },
    /// Lists the known story formats
    Formats,
}

type Result = anyhow::Result<(), anyhow::Error>;

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn publisher(config: &Config) -> Publisher {
    let loader = FormatLoader::with_timeout(config.registry(), config.timeout());
    let mut publisher = Publisher::new(loader, config.app_info());
    if let Some(f) = &config.default_format {
        publisher = publisher.with_default_format(&f.name, &f.version);
    }
    if let Some(f) = &config.proofing_format {
        publisher = publisher.with_proofing_format(&f.name, &f.version);
    }
    publisher
}

fn output_path(out: &Option<PathBuf>, config: &Config, source: &Path, story: &Story, suffix: &str) -> PathBuf {
    if let Some(out) = out {
        return out.clone();
    }
    let dir = config
        .output_dir()
        .or_else(|| source.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    dir.join(format!("{}{}.html", file_stem(story, "story"), suffix))
}

fn publish(publisher: &mut Publisher, config: &Config, args: &PublishArgs, mode: PublishMode) -> Result {
    let story = read_story(&args.story)?;
    let mut options = PublishOptions::mode(mode);
    if let Some(name) = &args.start {
        let passage = story.passage_with_name(name).ok_or_else(|| Error::UnknownPassage(name.clone()))?;
        options.start_passage = Some(passage.id.clone());
    }
    let published = publisher
        .publish_story(&story, &options)
        .with_context(|| format!("Could not publish {}", args.story.display()))?;
    for w in &published.warnings {
        eprintln!("Warning: {}", w);
    }
    let suffix = match mode {
        PublishMode::Play => "",
        PublishMode::Test => "-test",
        PublishMode::Proof => "-proof",
    };
    let out = output_path(&args.out, config, &args.story, &story, suffix);
    write_file(&out, &published.html)?;
    tracing::info!(story = %story.name, path = %out.display(), "Published story");
    Ok(())
}

fn archive(publisher: &mut Publisher, patterns: &[String], out: &Path) -> Result {
    let mut stories = vec![];
    for pattern in patterns {
        let paths = glob_paths(pattern, Path::new(""))?;
        if paths.is_empty() {
            anyhow::bail!("No story file matches {}", pattern);
        }
        for path in paths {
            stories.extend(read_stories(&path)?);
        }
    }
    let archive = publisher.publish_archive(&stories);
    for skipped in &archive.skipped {
        eprintln!("Warning: Skipped story \"{}\": {}", skipped.name, skipped.reason);
    }
    write_file(out, &archive.html)?;
    tracing::info!(stories = archive.stories, skipped = archive.skipped.len(), path = %out.display(), "Wrote archive");
    Ok(())
}

fn stats(path: &Path, json: bool) -> Result {
    let story = read_story(path)?;
    let stats = story_stats(&story);
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!("Characters: {}", stats.characters);
    println!("Words: {}", stats.words);
    println!("Passages: {}", stats.passages);
    println!("Links: {} ({} distinct)", stats.link_count, stats.links.len());
    if stats.broken_links.is_empty() {
        println!("Broken links: none");
    } else {
        println!("Broken links: {}", stats.broken_links.join(", "));
    }
    Ok(())
}

fn unpack(file: &Path, dir: &Path) -> Result {
    if !dir.is_dir() {
        return Err(Error::DirNotFound(dir.to_string_lossy().to_string()).into());
    }
    let mut i = 0;
    for story in read_stories(file)? {
        i += 1;
        let path = dir.join(file_stem(&story, &format!("story-{}", i)) + ".twee");
        write_file(&path, &serialize_twee3(&story))?;
        tracing::info!(story = %story.name, path = %path.display(), "Unpacked story");
    }
    Ok(())
}

fn watch(publisher: &mut Publisher, config: &Config, args: &PublishArgs, mode: PublishMode) -> Result {
    if let Err(e) = publish(publisher, config, args, mode) {
        eprintln!("Error: {:#}", e);
    }
    let name = args.story.file_name().map(|n| n.to_os_string());
    let dir = args
        .story
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let (tx, rx) = mpsc::channel::<notify::Result<notify::Event>>();
    let mut w = notify::recommended_watcher(tx)?;
    w.watch(dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("Could not watch {}", dir.display()))?;
    tracing::info!(path = %args.story.display(), "Watching for changes");
    for event in rx {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Watch error");
                continue;
            }
        };
        let touched = event.paths.iter().any(|p| p.file_name().map(|n| n.to_os_string()) == name);
        if touched && (event.kind.is_modify() || event.kind.is_create()) {
            if let Err(e) = publish(publisher, config, args, mode) {
                eprintln!("Error: {:#}", e);
            }
        }
    }
    Ok(())
}

fn formats(publisher: &mut Publisher) -> Result {
    publisher.loader_mut().load_all();
    let mut formats: Vec<_> = publisher.loader().registry().formats().iter().collect();
    formats.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.version.cmp(&b.version)));
    for format in formats {
        let mut notes = vec![];
        if format.is_proofing() {
            notes.push("proofing".to_string());
        }
        if !format.user_added {
            notes.push("built-in".to_string());
        }
        if let LoadState::Failed(e) = &format.state {
            notes.push(format!("failed: {}", e));
        }
        if notes.is_empty() {
            println!("{}", format.id());
        } else {
            println!("{} ({})", format.id(), notes.join(", "));
        }
    }
    Ok(())
}

fn main() -> Result {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let mut config = Config::load(cli.config.as_deref())?;
    if cli.timeout_ms.is_some() {
        config.timeout_ms = cli.timeout_ms;
    }
    let cwd = std::env::current_dir().context("Could not read the current directory")?;
    for pattern in cli.format_paths {
        // Patterns from the command line are relative to the working directory.
        config.format_paths.push(cwd.join(pattern).to_string_lossy().to_string());
    }
    let mut publisher = publisher(&config);
    match cli.command {
        Command::Publish(args) => publish(&mut publisher, &config, &args, PublishMode::Play)?,
        Command::Test(args) => publish(&mut publisher, &config, &args, PublishMode::Test)?,
        Command::Proof(args) => publish(&mut publisher, &config, &args, PublishMode::Proof)?,
        Command::Archive { stories, out } => archive(&mut publisher, &stories, &out)?,
        Command::Stats { story, json } => stats(&story, json)?,
        Command::Unpack { file, dir } => unpack(&file, &dir)?,
        Command::Watch { args, test } => {
            let mode = if test { PublishMode::Test } else { PublishMode::Play };
            watch(&mut publisher, &config, &args, mode)?
        }
        Command::Formats => formats(&mut publisher)?,
    }
    Ok(())
}

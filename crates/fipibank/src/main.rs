use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fipibank::Output;
use fipibank_core::{ExamId, Level};
use fipibank_local::assets::AssetStore;
use fipibank_local::classify::{Classifier, ClassifierConfig};
use fipibank_local::coverage::{self, DEFAULT_QUOTA};
use fipibank_local::crawl::{CrawlOptions, CrawlSummary, Crawler, DEFAULT_BASE_URL};
use fipibank_local::curate::Curator;
use fipibank_local::render_playwright::{LaunchOptions, PlaywrightSession};
use fipibank_local::store::CorpusLayout;
use fipibank_local::taxonomy::Taxonomy;
use fipibank_local::throttle::Throttle;
use fipibank_local::{relabel, sanitize};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fipibank")]
#[command(about = "Exam question bank crawler, classifier and corpus curator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Crawl the bank task by task and store raw cards.
    Crawl(CrawlCmd),
    /// Classify raw cards into the labeled tree (or the review tree).
    Curate(CurateCmd),
    /// Write coverage.md, wanted.csv and coverage.json.
    Report(ReportCmd),
    /// Exit 1 when any cell of the selected tasks is below quota.
    Gate(GateCmd),
    /// Move a record (usually from review) into a taxonomy cell.
    Relabel(RelabelCmd),
    /// Show what is still needed, from wanted.csv.
    PickNeeded(PickNeededCmd),
    /// Classify one text and show the label and why.
    Classify(ClassifyCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct CorpusArgs {
    /// Corpus root (raw, labeled, review and report trees live under it).
    #[arg(long, env = "FIPIBANK_DATA_DIR", default_value = "data/fipi")]
    data_dir: PathBuf,
    #[arg(long, default_value = "ege")]
    exam: ExamId,
    #[arg(long, default_value = "basic")]
    level: Level,
    /// Taxonomy JSON; the embedded one for the exam/level otherwise.
    #[arg(long, env = "FIPIBANK_TAXONOMY")]
    taxonomy: Option<PathBuf>,
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

impl CorpusArgs {
    fn layout(&self) -> CorpusLayout {
        CorpusLayout::new(&self.data_dir)
    }

    fn taxonomy(&self) -> Result<Taxonomy> {
        load_taxonomy(self.exam, self.level, self.taxonomy.as_ref())
    }

    fn output(&self) -> Output {
        Output::parse(&self.output)
    }
}

#[derive(clap::Args, Debug)]
struct ClassifierArgs {
    /// Minimum confidence for a label.
    #[arg(long, default_value_t = ClassifierConfig::default().threshold)]
    threshold: f64,
    /// Score divisor that maps blended scores into [0, 1].
    #[arg(long, default_value_t = ClassifierConfig::default().normalizer)]
    normalizer: f64,
}

impl ClassifierArgs {
    fn config(&self) -> Result<ClassifierConfig> {
        let cfg = ClassifierConfig {
            threshold: self.threshold,
            normalizer: self.normalizer,
            ..ClassifierConfig::default()
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

#[derive(clap::Args, Debug)]
struct CrawlCmd {
    #[command(flatten)]
    corpus: CorpusArgs,
    /// Bank start page.
    #[arg(long, env = "FIPI_BASE", default_value = DEFAULT_BASE_URL)]
    base_url: String,
    #[arg(long, env = "INGEST_USER_AGENT", default_value = "fipibank ingest bot")]
    user_agent: String,
    /// Requests per second for page transitions and asset downloads (jitter is added).
    #[arg(long, env = "INGEST_RATE", default_value_t = 1.0)]
    rate: f64,
    #[arg(long, env = "INGEST_HEADLESS", action = clap::ArgAction::Set, default_value_t = true)]
    headless: bool,
    #[arg(long, default_value_t = 1)]
    start_task: u32,
    #[arg(long, default_value_t = 11)]
    end_task: u32,
    #[arg(long, default_value_t = 1)]
    start_page: u32,
    #[arg(long, default_value_t = 50)]
    end_page: u32,
    /// Cards saved per task; 0 is a dry run.
    #[arg(long, default_value_t = 600)]
    limit: usize,
    /// Save first pages and synthetic-id card fragments here.
    #[arg(long)]
    debug_html: Option<PathBuf>,
    /// Assets are written to `{public_dir}/fipi/`.
    #[arg(long, env = "FIPIBANK_PUBLIC_DIR", default_value = "public")]
    public_dir: PathBuf,
    /// Keep remote asset URLs only.
    #[arg(long)]
    no_assets: bool,
}

#[derive(clap::Args, Debug)]
struct CurateCmd {
    #[command(flatten)]
    corpus: CorpusArgs,
    #[command(flatten)]
    classifier: ClassifierArgs,
    /// Stop after this many raw files.
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(clap::Args, Debug)]
struct ReportCmd {
    #[command(flatten)]
    corpus: CorpusArgs,
    #[arg(long, default_value_t = DEFAULT_QUOTA)]
    quota: u32,
    /// Defaults to `{data_dir}/_reports`.
    #[arg(long)]
    out_dir: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct GateCmd {
    #[command(flatten)]
    corpus: CorpusArgs,
    #[arg(long, default_value_t = DEFAULT_QUOTA)]
    quota: u32,
    /// Task numbers to check, e.g. `1-5` or `1,3,7`.
    #[arg(long, default_value = "1-5")]
    tasks: String,
}

#[derive(clap::Args, Debug)]
struct RelabelCmd {
    #[command(flatten)]
    corpus: CorpusArgs,
    /// Record file to move.
    file: PathBuf,
    #[arg(long)]
    task: u32,
    #[arg(long)]
    subtopic: String,
}

#[derive(clap::Args, Debug)]
struct PickNeededCmd {
    #[command(flatten)]
    corpus: CorpusArgs,
    /// Defaults to `{data_dir}/_reports/wanted.csv`.
    #[arg(long)]
    wanted: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct ClassifyCmd {
    #[command(flatten)]
    corpus: CorpusArgs,
    #[command(flatten)]
    classifier: ClassifierArgs,
    /// Text to classify; `--file` or stdin otherwise.
    text: Option<String>,
    #[arg(long)]
    file: Option<PathBuf>,
    /// Also list every scored cell.
    #[arg(long)]
    explain: bool,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

fn load_taxonomy(exam: ExamId, level: Level, path: Option<&PathBuf>) -> Result<Taxonomy> {
    let tax = match path {
        Some(p) => Taxonomy::load(exam, level, p)?,
        None => Taxonomy::embedded(exam, level)
            .with_context(|| format!("no embedded taxonomy for {exam}/{level}; pass --taxonomy"))?,
    };
    Ok(tax)
}

fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("fipibank=info".parse()?))
        .init();
    Ok(())
}

async fn run_crawl(args: CrawlCmd) -> Result<()> {
    let opts = CrawlOptions {
        exam: args.corpus.exam,
        level: args.corpus.level,
        base_url: args.base_url.clone(),
        start_task: args.start_task,
        end_task: args.end_task,
        start_page: args.start_page,
        end_page: args.end_page,
        limit: args.limit,
        debug_html: args.debug_html.clone(),
        ..CrawlOptions::default()
    };
    let layout = args.corpus.layout();
    let sanitizer = sanitize::default_sanitizer();
    let throttle = Throttle::new(args.rate);
    tracing::info!(
        exam = %opts.exam,
        level = %opts.level,
        tasks = ?(opts.start_task..=opts.end_task),
        sanitizer = sanitizer.name(),
        "crawl"
    );

    let summary = if opts.is_dry_run() {
        CrawlSummary {
            dry_run: true,
            ..CrawlSummary::default()
        }
    } else {
        let launch = LaunchOptions {
            headless: args.headless,
            user_agent: Some(args.user_agent.clone()),
            ..LaunchOptions::default()
        };
        let session = PlaywrightSession::launch(&launch).await?;
        let assets = AssetStore::new(&args.public_dir, &args.user_agent)?;
        let mut crawler = Crawler::new(&session, &layout, sanitizer.as_ref(), &throttle, &opts);
        if !args.no_assets {
            crawler = crawler.with_assets(&assets);
        }
        let result = crawler.run().await;
        session.close().await;
        result?
    };

    match args.corpus.output() {
        Output::Text => {
            if summary.dry_run {
                println!("dry run (limit 0): nothing crawled");
            }
            for line in summary.lines() {
                println!("{line}");
            }
            if !summary.failed_tasks.is_empty() {
                println!("failed tasks: {:?}", summary.failed_tasks);
            }
        }
        Output::Json => print_json(&summary)?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Some(p) = std::env::var_os("FIPIBANK_ENV_FILE").filter(|p| !p.is_empty()) {
        let p = PathBuf::from(p);
        fipibank::load_env_file(&p).with_context(|| format!("reading {}", p.display()))?;
    }

    let cli = Cli::parse();
    init_tracing()?;

    match cli.command {
        Commands::Crawl(args) => run_crawl(args).await?,
        Commands::Curate(args) => {
            let layout = args.corpus.layout();
            let taxonomy = args.corpus.taxonomy()?;
            let classifier = Classifier::new(&taxonomy, args.classifier.config()?);
            let sanitizer = sanitize::default_sanitizer();
            let curator = Curator::new(&layout, &taxonomy, classifier, sanitizer.as_ref());
            let summary = curator.curate(args.limit);
            match args.corpus.output() {
                Output::Text => println!(
                    "files {}: created {}, updated {}, skipped {}, review {}, failed {}",
                    summary.files,
                    summary.created,
                    summary.updated,
                    summary.skipped,
                    summary.review,
                    summary.failed
                ),
                Output::Json => print_json(&summary)?,
            }
        }
        Commands::Report(args) => {
            let layout = args.corpus.layout();
            let taxonomy = args.corpus.taxonomy()?;
            let report = coverage::report(&layout, &taxonomy, args.quota);
            let dir = args.out_dir.clone().unwrap_or_else(|| layout.reports_dir());
            let artifacts = report.write_artifacts(&dir)?;
            match args.corpus.output() {
                Output::Text => {
                    print!("{}", report.to_markdown());
                    println!("wrote {}", artifacts.markdown.display());
                    println!("wrote {}", artifacts.csv.display());
                    println!("wrote {}", artifacts.json.display());
                }
                Output::Json => print_json(&serde_json::json!({
                    "artifacts": artifacts,
                    "totals": report.totals,
                    "shortages": report.shortages().len(),
                }))?,
            }
        }
        Commands::Gate(args) => {
            let tasks = fipibank::parse_task_set(&args.tasks).map_err(anyhow::Error::msg)?;
            let layout = args.corpus.layout();
            let taxonomy = args.corpus.taxonomy()?;
            let report = coverage::report(&layout, &taxonomy, args.quota);
            let result = coverage::gate(&report, &tasks);
            if !result.passed {
                eprint!("{}", result.text);
                eprintln!("gate failed: {} cell(s) below quota", result.failing.len());
                std::process::exit(1);
            }
            match args.corpus.output() {
                Output::Text => {
                    print!("{}", result.text);
                    println!("gate passed");
                }
                Output::Json => print_json(&result)?,
            }
        }
        Commands::Relabel(args) => {
            let layout = args.corpus.layout();
            let taxonomy = args.corpus.taxonomy()?;
            let moved = relabel::relabel(&layout, &taxonomy, &args.file, args.task, &args.subtopic)?;
            match args.corpus.output() {
                Output::Text => println!("{} -> {}", moved.from.display(), moved.to.display()),
                Output::Json => print_json(&moved)?,
            }
        }
        Commands::PickNeeded(args) => {
            let wanted = args
                .wanted
                .clone()
                .unwrap_or_else(|| args.corpus.layout().reports_dir().join("wanted.csv"));
            let shortages = coverage::read_wanted(&wanted)
                .with_context(|| format!("run `fipibank report` first ({})", wanted.display()))?;
            match args.corpus.output() {
                Output::Text => print!(
                    "{}",
                    coverage::pick_needed_text(&shortages, args.corpus.exam, args.corpus.level)
                ),
                Output::Json => print_json(&serde_json::json!({
                    "nothingToPick": shortages.is_empty(),
                    "shortages": shortages,
                }))?,
            }
        }
        Commands::Classify(args) => {
            let text = match (&args.text, &args.file) {
                (Some(t), _) => t.clone(),
                (None, Some(p)) => std::fs::read_to_string(p)
                    .with_context(|| format!("reading {}", p.display()))?,
                (None, None) => std::io::read_to_string(std::io::stdin())?,
            };
            if text.trim().is_empty() {
                bail!("nothing to classify: pass TEXT, --file, or pipe text on stdin");
            }
            let taxonomy = args.corpus.taxonomy()?;
            let classifier = Classifier::new(&taxonomy, args.classifier.config()?);
            let label = classifier.classify(&text);
            let scores = if args.explain {
                classifier.explain(&text)
            } else {
                Vec::new()
            };
            match args.corpus.output() {
                Output::Text => {
                    match &label {
                        Some(l) => println!(
                            "task {} / {} (confidence {:.2}) hits: {}",
                            l.task_no,
                            l.subtopic,
                            l.confidence,
                            l.hits.join(", ")
                        ),
                        None => println!("no label"),
                    }
                    for s in &scores {
                        println!(
                            "  {:>2} {:<32} {:.2} (kw {}, heur {})",
                            s.task_no, s.subtopic, s.confidence, s.keyword_score, s.heuristic_score
                        );
                    }
                }
                Output::Json => {
                    let mut v = serde_json::json!({
                        "label": label,
                        "threshold": classifier.config().threshold,
                    });
                    if args.explain {
                        v["scores"] = serde_json::to_value(&scores)?;
                    }
                    print_json(&v)?
                }
            }
        }
        Commands::Version(args) => {
            let v = serde_json::json!({
                "schema_version": 1,
                "kind": "version",
                "ok": true,
                "name": "fipibank",
                "version": env!("CARGO_PKG_VERSION"),
                "sanitizer": sanitize::default_sanitizer().name(),
            });
            match Output::parse(&args.output) {
                Output::Text => println!("fipibank {}", env!("CARGO_PKG_VERSION")),
                Output::Json => println!("{v}"),
            }
        }
    }
    Ok(())
}

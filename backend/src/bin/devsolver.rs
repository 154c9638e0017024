//! Command-line client for a running DevSolver backend.
//!
//! ```bash
//! devsolver query --technology python --code-file app.py "Why is this slow?"
//! devsolver query --technology react --github-url https://github.com/acme/ui/tree/main/src "Where is state lost?"
//! devsolver upload app.py --technology python
//! devsolver technologies
//! devsolver health
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use devsolver_backend::client::presenter::render;
use devsolver_backend::client::{NotificationCenter, QuerySubmitter, SubmitError, Tab, UploadOutcome};
use devsolver_backend::models::{CodeSource, QueryRequest, ResponseSourcePreference, Technology};

#[derive(Parser)]
#[command(name = "devsolver", version, about = "Ask DevSolver about your code")]
struct Cli {
    /// Backend base URL.
    #[arg(long, global = true, env = "DEVSOLVER_URL", default_value = "http://localhost:8000")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a question about a snippet, a file or a GitHub location.
    Query {
        question: String,

        #[arg(long, short)]
        technology: String,

        /// Read the code from this file.
        #[arg(long, conflicts_with_all = ["code", "github_url"])]
        code_file: Option<PathBuf>,

        /// Inline code.
        #[arg(long, conflicts_with = "github_url")]
        code: Option<String>,

        /// GitHub repository, directory or file URL.
        #[arg(long)]
        github_url: Option<String>,

        /// Extra context for the question.
        #[arg(long)]
        context: Option<String>,

        #[arg(long, value_enum, default_value_t = PoolArg::Both)]
        pool: PoolArg,

        /// Which tab to print; all of them by default.
        #[arg(long, value_enum)]
        tab: Option<TabArg>,
    },

    /// Upload a file for analysis, optionally with a question.
    Upload {
        file: PathBuf,

        #[arg(long, short)]
        technology: String,

        #[arg(long, short)]
        query: Option<String>,
    },

    /// List supported technologies.
    Technologies,

    /// Show backend health.
    Health,
}

#[derive(Clone, Copy, ValueEnum)]
enum PoolArg {
    Official,
    Community,
    Both,
}

#[derive(Clone, Copy, ValueEnum)]
enum TabArg {
    Official,
    Community,
    Analysis,
}

impl From<TabArg> for Tab {
    fn from(tab: TabArg) -> Self {
        match tab {
            TabArg::Official => Tab::Official,
            TabArg::Community => Tab::Community,
            TabArg::Analysis => Tab::Analysis,
        }
    }
}

fn parse_technology(value: &str) -> anyhow::Result<Technology> {
    match Technology::parse(value) {
        Some(technology) => Ok(technology),
        None => bail!(
            "unsupported technology '{}' (expected one of: {})",
            value,
            Technology::ALL.map(|t| t.as_str()).join(", ")
        ),
    }
}

fn print_tabs(response: &devsolver_backend::models::QueryResponse, tab: Option<TabArg>) {
    let tabs: Vec<Tab> = match tab {
        Some(tab) => vec![tab.into()],
        None => Tab::ALL.to_vec(),
    };
    for tab in tabs {
        println!("## {}\n\n{}\n", tab.title(), render(response, tab));
    }
    println!("({:.2}s)", response.execution_time);
}

// Show what the notification center holds; the error itself only goes to the debug log
fn fail(notifications: &NotificationCenter, error: SubmitError) -> ! {
    for n in notifications.list() {
        eprintln!("{}", n.message);
    }
    log::debug!("{}", error);
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let notifications = NotificationCenter::new();
    let submitter = QuerySubmitter::new(&cli.url, notifications.clone())?;

    match cli.command {
        Commands::Query {
            question,
            technology,
            code_file,
            code,
            github_url,
            context,
            pool,
            tab,
        } => {
            let technology = parse_technology(&technology)?;
            let (source, code_snippet, file_name) = match (code_file, code, &github_url) {
                (Some(path), _, _) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
                    (CodeSource::File, Some(text), name)
                }
                (None, Some(code), _) => (CodeSource::Snippet, Some(code), None),
                (None, None, Some(_)) => (CodeSource::Github, None, None),
                (None, None, None) => bail!("one of --code-file, --code or --github-url is required"),
            };

            let request = QueryRequest {
                source,
                technology,
                code_snippet,
                github_repo: None,
                github_url,
                file_name,
                context,
                query: question,
                response_source_preference: match pool {
                    PoolArg::Official => ResponseSourcePreference::Official,
                    PoolArg::Community => ResponseSourcePreference::Community,
                    PoolArg::Both => ResponseSourcePreference::Both,
                },
            };

            match submitter.submit(request).await {
                Ok(response) => print_tabs(&response, tab),
                Err(e) => fail(&notifications, e),
            }
        }
        Commands::Upload { file, technology, query } => {
            let technology = parse_technology(&technology)?;
            match submitter.upload_file(&file, technology, query.as_deref()).await {
                Ok(UploadOutcome::Answered(response)) => print_tabs(&response, None),
                Ok(UploadOutcome::Analyzed(ack)) => {
                    println!("{} ({} bytes, {})\n", ack.filename, ack.size, ack.technology);
                    println!("{}", serde_json::to_string_pretty(&ack.analysis)?);
                }
                Err(e) => fail(&notifications, e),
            }
        }
        Commands::Technologies => {
            for technology in submitter.technologies().await? {
                println!("{}", technology);
            }
        }
        Commands::Health => {
            println!("{}", serde_json::to_string_pretty(&submitter.health().await?)?);
        }
    }

    Ok(())
}

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use pgcriteria::config::Settings;
use pgcriteria::criteria::{Criteria, OrderBy};
use pgcriteria::db::{create_client, PgBackend};
use pgcriteria::persister::Persister;
use pgcriteria::repository::{QueryInput, Repository};

/// Compile criteria maps and query text into PostgreSQL
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the SELECT a criteria map lowers to
    Lower(CriteriaArgs),
    /// Print the count-aggregate form of a criteria map
    Count {
        #[arg(long, short)]
        entity: String,
        /// Criteria as a JSON object
        #[arg(long, short, default_value = "{}")]
        criteria: String,
    },
    /// Parse query text and print its condition and SQL
    Parse {
        #[arg(long, short)]
        entity: String,
        text: String,
    },
    /// Execute against the configured database and print rows as JSON
    Run {
        #[command(flatten)]
        criteria: CriteriaArgs,
        /// Query text instead of a criteria map
        #[arg(long, conflicts_with = "criteria")]
        text: Option<String>,
        /// Fetch exactly one row
        #[arg(long)]
        one: bool,
        /// Print the count instead of rows
        #[arg(long, conflicts_with = "one")]
        count: bool,
    },
}

#[derive(Args)]
struct CriteriaArgs {
    #[arg(long, short)]
    entity: String,
    /// Criteria as a JSON object
    #[arg(long, short, default_value = "{}")]
    criteria: String,
    /// Sort as field[:asc|desc], repeatable
    #[arg(long = "order", short)]
    order: Vec<String>,
    #[arg(long)]
    limit: Option<u64>,
    #[arg(long)]
    offset: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Command::Lower(args) => {
            let persister = settings.persister(&args.entity)?;
            let mut query = settings.composer(persister.clone()).compose(
                &parse_criteria(&args.criteria)?,
                &parse_order(&args.order),
                args.limit,
                args.offset,
            )?;
            query.bind(persister)?;
            println!("{}", query.native_query()?);
        }
        Command::Count { entity, criteria } => {
            let persister = settings.persister(&entity)?;
            let mut query = settings.composer(persister.clone()).compose(
                &parse_criteria(&criteria)?,
                &OrderBy::new(),
                None,
                None,
            )?;
            query.bind(persister)?;
            let count = query.count_form()?;
            println!("-- strategy: {:?}", count.strategy());
            println!("{}", count.sql());
        }
        Command::Parse { entity, text } => {
            let persister = settings.persister(&entity)?;
            let mut query = settings.composer(persister.clone()).text_parser().parse(&text)?;
            if let Some(condition) = query.condition() {
                println!("-- condition: {}", condition);
            }
            query.bind(persister)?;
            println!("{}", query.native_query()?);
        }
        Command::Run {
            criteria,
            text,
            one,
            count,
        } => {
            let persister = settings.persister(&criteria.entity)?;
            let repo = connect(&settings, persister).await?;
            run(&repo, criteria, text, one, count).await?;
        }
    }

    Ok(())
}

async fn connect(settings: &Settings, persister: Arc<Persister>) -> Result<Repository<PgBackend>> {
    let mut config = settings.connection.clone();

    // Resolve password: PGPASSWORD env var, then interactive prompt
    if config.password.is_empty() {
        if let Ok(pw) = std::env::var("PGPASSWORD") {
            config.password = pw;
        } else {
            let prompt = format!("Password for {}: ", config.display_string());
            config.password = rpassword::read_password_from_tty(Some(&prompt))?;
        }
    }

    let client = create_client(&config).await?;
    let composer = settings.composer(persister.clone());
    Ok(Repository::new(persister, PgBackend::new(client)).with_parser(composer))
}

async fn run(
    repo: &Repository<PgBackend>,
    args: CriteriaArgs,
    text: Option<String>,
    one: bool,
    count: bool,
) -> Result<()> {
    let criteria = parse_criteria(&args.criteria)?;
    let order = parse_order(&args.order);

    if count {
        println!("{}", repo.count_by(&criteria).await?);
        return Ok(());
    }
    if one {
        let row = repo.find_one_by(&criteria, &order).await?;
        println!("{}", serde_json::to_string_pretty(&row.to_json())?);
        return Ok(());
    }

    let rows = match text {
        Some(text) => repo.find_by_query(QueryInput::Text(text)).await?,
        None => {
            repo.find_by(&criteria, &order, args.limit, args.offset)
                .await?
        }
    };
    for row in rows.iter() {
        println!("{}", row.to_json());
    }
    eprintln!("({} rows)", rows.len());
    Ok(())
}

fn parse_criteria(raw: &str) -> Result<Criteria> {
    match serde_json::from_str(raw).context("criteria must be valid JSON")? {
        serde_json::Value::Object(map) => Ok(map),
        other => anyhow::bail!("criteria must be a JSON object, got {}", other),
    }
}

fn parse_order(items: &[String]) -> OrderBy {
    items.iter().fold(OrderBy::new(), |order, item| {
        match item.split_once(':') {
            Some((field, direction)) => order.push(field, direction),
            None => order.push(item.as_str(), "asc"),
        }
    })
}

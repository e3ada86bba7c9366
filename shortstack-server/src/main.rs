use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use shortstack::search::SearchEngine;
use shortstack::{BackendKind, ObjectStore, Pager, Record, Shortstack, StoreConfig, Tenant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "shortstack", about = "Operate a shortstack object store and its search indexes")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON config file; environment variables are used when absent
    #[arg(long, env = "SHORTSTACK_CONFIG")]
    config: Option<String>,
    #[arg(long, env = "SHORTSTACK_DATA_DIR")]
    data_dir: Option<String>,
    /// table, sqlite, index or memory
    #[arg(long, env = "SHORTSTACK_BACKEND")]
    backend: Option<BackendKind>,
}

#[derive(Args)]
struct TenantArg {
    tenant: String,
    /// Route the tenant to shared storage
    #[arg(long)]
    shared: bool,
}

impl TenantArg {
    fn id(&self) -> String {
        if self.shared {
            Tenant::shared(&self.tenant).id
        } else {
            self.tenant.clone()
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Provision storage and index for a tenant
    CreateTenant(TenantArg),
    /// Remove a tenant's storage and index, waiting for background cleanup
    DeleteTenant(TenantArg),
    /// Rebuild a tenant's index from the object store
    Reindex(TenantArg),
    /// Count indexed records
    Count {
        #[command(flatten)]
        tenant: TenantArg,
        #[arg(long = "type")]
        kind: Option<String>,
    },
    /// Free-text search
    Search {
        #[command(flatten)]
        tenant: TenantArg,
        query: String,
        #[arg(long = "type")]
        kind: Option<String>,
        #[arg(long, default_value = "0")]
        limit: usize,
        #[arg(long, default_value = "1")]
        page: u64,
    },
    /// Create a record and index it
    Put {
        #[command(flatten)]
        tenant: TenantArg,
        #[arg(long = "type")]
        kind: String,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        name: Option<String>,
        /// Properties as a JSON object
        #[arg(long)]
        props: Option<String>,
    },
    /// Read a record from the object store
    Get {
        #[command(flatten)]
        tenant: TenantArg,
        id: String,
    },
}

fn load_config(cli: &Cli) -> shortstack::Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::from_env(),
    };
    if let Some(dir) = &cli.data_dir {
        config = config.with_data_dir(dir);
    }
    if let Some(backend) = cli.backend {
        config = config.with_backend(backend);
    }
    Ok(config)
}

fn print_json(value: &impl serde::Serialize) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli, app: &Shortstack) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::CreateTenant(t) => {
            app.create_tenant(&Tenant::new(t.id())).await?;
            eprintln!("Created tenant {}", t.tenant);
        }
        Command::DeleteTenant(t) => {
            let jobs = app.delete_tenant(&Tenant::new(t.id())).await?;
            let mut removed = 0;
            for job in jobs {
                removed += job.await??;
            }
            eprintln!("Deleted tenant {} ({} shared rows removed)", t.tenant, removed);
        }
        Command::Reindex(t) => {
            let report = app.reindex(&t.id()).await?;
            eprintln!(
                "Reindexed {} records into {} (previous: {})",
                report.copied,
                report.physical,
                report.previous.as_deref().unwrap_or("none")
            );
        }
        Command::Count { tenant, kind } => {
            println!("{}", app.search().count(&tenant.id(), kind.as_deref()).await);
        }
        Command::Search {
            tenant,
            query,
            kind,
            limit,
            page,
        } => {
            let mut pager = Pager::new(limit).with_page(page);
            let hits = app
                .search()
                .find_query(&tenant.id(), kind.as_deref(), &query, &mut pager)
                .await;
            print_json(&serde_json::json!({ "total": pager.count, "hits": hits }))?;
        }
        Command::Put {
            tenant,
            kind,
            id,
            name,
            props,
        } => {
            let mut record = Record::new(kind);
            if let Some(id) = id {
                record = record.with_id(id);
            }
            if let Some(name) = name {
                record = record.with_name(name);
            }
            if let Some(props) = props {
                match serde_json::from_str::<Value>(&props)? {
                    Value::Object(map) => record.properties.extend(map),
                    _ => return Err("--props must be a JSON object".into()),
                }
            }
            match app.put(&tenant.id(), &mut record).await? {
                Some(id) => println!("{}", id),
                None => return Err("record was not stored".into()),
            }
        }
        Command::Get { tenant, id } => match app.store().read(&tenant.id(), &id).await? {
            Some(record) => print_json(&record)?,
            None => return Err(format!("record {} not found", id).into()),
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let app = Shortstack::open(config)?;
    let result = run(cli, &app).await;
    app.shutdown();
    result
}

//! Subaccount Ledger - operator CLI
//!
//! Read and administer ledger state persisted in SQLite.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use subaccount_ledger::config::{Config, LoggingConfig};
use subaccount_ledger::external::{InMemoryBank, InMemoryMarkets, RecordingEventSink};
use subaccount_ledger::ledger::{
    get_negative_tnc_seen_at, get_subaccount, list_subaccounts, set_negative_tnc_seen_at,
    BlockContext, Ledger, SafetyHeap,
};
use subaccount_ledger::store::SqliteStore;
use subaccount_ledger::types::{Address, PositionSide, Subaccount, SubaccountId, Update};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Subaccount Ledger CLI
#[derive(Parser)]
#[command(name = "subledger")]
#[command(version, about = "Inspect and administer subaccount collateral state")]
struct Cli {
    /// Path to SQLite database (overrides configuration)
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show one subaccount and, when markets are configured, its collateralization
    Show {
        /// Owner address
        owner: String,

        /// Subaccount number
        #[arg(short, long, default_value = "0")]
        number: u32,
    },

    /// List every stored subaccount
    List,

    /// List a safety heap in array order
    Heap {
        /// Perpetual market id
        perpetual_id: u32,

        /// Side of the market
        #[arg(short, long, value_enum, default_value = "long")]
        side: SideArg,
    },

    /// Read or set the negative-TNC block marker of a collateral pool
    NegativeTnc {
        #[command(subcommand)]
        action: NegativeTncAction,
    },

    /// Mark pools of subaccounts with negative net collateral at a block
    Detect {
        /// Current block height
        #[arg(long)]
        height: u32,
    },
}

#[derive(Subcommand)]
enum NegativeTncAction {
    /// Print the stored marker (0 means never seen)
    Get {
        /// `cross`, `isolated:<perpetual id>` or a hex address
        pool: String,
    },
    /// Move the marker forward
    Set {
        /// `cross`, `isolated:<perpetual id>` or a hex address
        pool: String,

        /// Block height to record
        block: u32,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SideArg {
    Long,
    Short,
}

impl From<SideArg> for PositionSide {
    fn from(side: SideArg) -> Self {
        match side {
            SideArg::Long => PositionSide::Long,
            SideArg::Short => PositionSide::Short,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load()?;
    config.validate()?;
    init_logging(&config.logging)?;

    let db_path = cli.db.clone().unwrap_or_else(|| config.storage.db_path.clone());
    let mut store = SqliteStore::open(&db_path)?;
    info!(db = %db_path, "Opened ledger store");

    match cli.command {
        Commands::Show { owner, number } => {
            let id = SubaccountId::new(owner, number);
            let subaccount = get_subaccount(&store, &id)?;
            print_subaccount(&subaccount);
            if let Some(ledger) = load_ledger(&config)? {
                let risk = ledger
                    .get_net_collateral_and_margin_requirements(&store, &Update::new(id))?;
                println!("   ├─ Net Collateral:  {}", risk.nc);
                println!("   ├─ Initial Margin:  {}", risk.imr);
                println!("   ├─ Maint. Margin:   {}", risk.mmr);
                println!("   └─ Health:          {}", risk.health());
            }
        }
        Commands::List => {
            let subaccounts = list_subaccounts(&store)?;
            if subaccounts.is_empty() {
                println!("No subaccounts stored.");
            }
            for subaccount in &subaccounts {
                println!(
                    "{:<48} balance {:>24}  positions {}",
                    subaccount.id.to_string(),
                    subaccount.settlement_balance().to_string(),
                    subaccount.perpetual_positions.len()
                );
            }
        }
        Commands::Heap { perpetual_id, side } => {
            let heap = SafetyHeap::new(perpetual_id, side.into());
            let ids = heap.ids(&store)?;
            println!(
                "Safety heap ({}, {}): {} entries",
                perpetual_id,
                heap.side(),
                ids.len()
            );
            for (i, id) in ids.iter().enumerate() {
                println!("   {:>6}  {}", i, id);
            }
        }
        Commands::NegativeTnc { action } => match action {
            NegativeTncAction::Get { pool } => {
                let pool = parse_pool(&pool)?;
                println!("{} {}", pool, get_negative_tnc_seen_at(&store, &pool)?);
            }
            NegativeTncAction::Set { pool, block } => {
                let pool = parse_pool(&pool)?;
                set_negative_tnc_seen_at(&mut store, &pool, block)?;
                info!(pool = %pool, block, "Negative TNC marker updated");
            }
        },
        Commands::Detect { height } => {
            let Some(ledger) = load_ledger(&config)? else {
                bail!("storage.markets_path must be configured to detect negative TNC");
            };
            let ids: Vec<SubaccountId> = list_subaccounts(&store)?
                .into_iter()
                .map(|s| s.id)
                .collect();
            let marked =
                ledger.mark_negative_tnc_subaccounts(&mut store, &BlockContext::at(height), &ids)?;
            if marked.is_empty() {
                info!(checked = ids.len(), "No negative TNC subaccounts");
            }
            for pool in marked {
                warn!(pool = %pool, height, "Negative TNC subaccount seen");
            }
        }
    }

    Ok(())
}

type CliLedger = Ledger<InMemoryMarkets, InMemoryBank, RecordingEventSink>;

/// A read-only ledger over the configured markets file, if there is one.
fn load_ledger(config: &Config) -> Result<Option<CliLedger>> {
    let Some(path) = &config.storage.markets_path else {
        return Ok(None);
    };
    let markets = InMemoryMarkets::from_json_file(path)?;
    Ok(Some(Ledger::new(
        config.ledger.clone(),
        markets,
        InMemoryBank::new(),
        RecordingEventSink::default(),
    )))
}

fn parse_pool(raw: &str) -> Result<Address> {
    if raw == "cross" {
        return Ok(Address::cross_collateral_pool());
    }
    if let Some(id) = raw.strip_prefix("isolated:") {
        let id: u32 = id.parse().context("Invalid perpetual id")?;
        return Ok(Address::isolated_collateral_pool(id));
    }
    raw.parse()
        .with_context(|| format!("Invalid pool address {:?}", raw))
}

fn print_subaccount(subaccount: &Subaccount) {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║  SUBACCOUNT {:<47}║", subaccount.id.to_string());
    println!("╚════════════════════════════════════════════════════════════╝");

    if subaccount.is_empty() {
        println!("\n(no positions)");
        return;
    }

    println!("\n💰 Assets");
    for asset in &subaccount.asset_positions {
        println!("   ├─ asset {}: {}", asset.asset_id, asset.quantums);
    }
    println!("   └─ yield index: {}", subaccount.asset_yield_index);

    if !subaccount.perpetual_positions.is_empty() {
        println!("\n📈 Perpetual Positions");
        for position in &subaccount.perpetual_positions {
            println!("   ┌─ perpetual {} ({})", position.perpetual_id, position.side());
            println!("   ├─ size:          {}", position.quantums);
            println!("   ├─ funding index: {}", position.funding_index);
            println!("   ├─ yield index:   {}", position.yield_index);
            println!("   └─ quote balance: {}", position.quote_balance);
        }
    }
    println!();
}

/// Initialize logging: `RUST_LOG` wins over the configured filter.
fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.filter)
            .with_context(|| format!("Invalid log filter {:?}", logging.filter))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.with_ansi(true).init();
    }

    Ok(())
}

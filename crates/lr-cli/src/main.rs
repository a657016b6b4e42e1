use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use lr_core::{
    DefaultPolicy, FirewallRuleInput, IpRuleInput, LockRegistry, RouteInput, RuleAction,
    Settings, SystemRunner, Table,
};
use lr_link::{LinkCollector, LinkControl};
use lr_persist::PersistEngine;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lrouter")]
#[command(version, about = "Firewall, route and policy-rule management", long_about = None)]
struct Cli {
    /// Settings file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print listings as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// iptables chains and rules
    Firewall {
        #[command(subcommand)]
        action: FirewallAction,
    },
    /// Routing table entries
    Route {
        #[command(subcommand)]
        action: RouteAction,
    },
    /// Policy-routing rules
    Rule {
        #[command(subcommand)]
        action: RuleCommand,
    },
    /// Network interfaces usable as `dev`
    Link {
        #[command(subcommand)]
        action: Option<LinkAction>,
    },
    /// Snapshot live state into the store
    Save,
    /// Replay the store against the kernel
    Restore,
    /// Show differences between the store and live state
    Diff,
    /// Write the store as a .tar.gz archive
    Export {
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Unpack a .tar.gz archive into the store
    Import { archive: PathBuf },
}

#[derive(Subcommand)]
enum FirewallAction {
    /// List chains of a table, or a single chain
    List {
        #[arg(short, long, default_value = "filter")]
        table: Table,
        #[arg(long)]
        chain: Option<String>,
    },
    /// Show a chain as rule specifications
    Specs {
        #[arg(short, long, default_value = "filter")]
        table: Table,
        chain: String,
    },
    /// Append a rule, or insert it with --position
    Add(FirewallRuleArgs),
    /// Delete the rule at a 1-based position
    Delete {
        #[arg(short, long, default_value = "filter")]
        table: Table,
        chain: String,
        position: u32,
    },
    /// Move a rule to another position in the same chain
    Move {
        #[arg(short, long, default_value = "filter")]
        table: Table,
        chain: String,
        from: u32,
        to: u32,
    },
    CreateChain {
        #[arg(short, long, default_value = "filter")]
        table: Table,
        chain: String,
    },
    DeleteChain {
        #[arg(short, long, default_value = "filter")]
        table: Table,
        chain: String,
    },
    /// Flush one chain, or the whole table without --chain
    Flush {
        #[arg(short, long, default_value = "filter")]
        table: Table,
        #[arg(long)]
        chain: Option<String>,
    },
    /// Set the default policy of a built-in chain
    Policy {
        #[arg(short, long, default_value = "filter")]
        table: Table,
        chain: String,
        policy: DefaultPolicy,
    },
    /// Print the full ruleset dump
    Dump,
    /// Replace the ruleset from a dump file
    Load { file: PathBuf },
}

#[derive(Args)]
struct FirewallRuleArgs {
    #[arg(short, long, default_value = "filter")]
    table: Table,
    chain: String,
    #[arg(short = 'j', long)]
    target: String,
    #[arg(long)]
    position: Option<u32>,
    #[arg(short, long)]
    protocol: Option<String>,
    #[arg(short, long)]
    source: Option<String>,
    #[arg(short, long)]
    destination: Option<String>,
    #[arg(long = "in")]
    in_interface: Option<String>,
    #[arg(long = "out")]
    out_interface: Option<String>,
    #[arg(long)]
    sport: Option<String>,
    #[arg(long)]
    dport: Option<String>,
    #[arg(long)]
    state: Option<String>,
    #[arg(long)]
    comment: Option<String>,
    #[arg(long)]
    to_destination: Option<String>,
    #[arg(long)]
    to_source: Option<String>,
}

impl From<FirewallRuleArgs> for FirewallRuleInput {
    fn from(args: FirewallRuleArgs) -> Self {
        Self {
            table: args.table,
            chain: args.chain,
            position: args.position,
            protocol: args.protocol,
            source: args.source,
            destination: args.destination,
            in_interface: args.in_interface,
            out_interface: args.out_interface,
            sport: args.sport,
            dport: args.dport,
            state: args.state,
            comment: args.comment,
            target: args.target,
            to_destination: args.to_destination,
            to_source: args.to_source,
        }
    }
}

#[derive(Subcommand)]
enum RouteAction {
    /// List one table, or every table with --all
    List {
        #[arg(short, long, default_value = "main")]
        table: String,
        #[arg(long)]
        all: bool,
    },
    Add(RouteArgs),
    Delete(RouteArgs),
    Flush {
        #[arg(short, long)]
        table: String,
    },
    /// Routing tables known to the registry
    Tables,
}

#[derive(Args)]
struct RouteArgs {
    destination: String,
    #[arg(long)]
    via: Option<String>,
    #[arg(long)]
    dev: Option<String>,
    #[arg(long)]
    metric: Option<u32>,
    #[arg(short, long)]
    table: Option<String>,
}

impl From<RouteArgs> for RouteInput {
    fn from(args: RouteArgs) -> Self {
        Self {
            destination: args.destination,
            gateway: args.via,
            interface: args.dev,
            metric: args.metric,
            table: args.table,
        }
    }
}

#[derive(Subcommand)]
enum RuleCommand {
    List,
    Add(RuleArgs),
    /// Delete the rule holding a priority
    Delete { priority: u32 },
}

#[derive(Subcommand)]
enum LinkAction {
    List,
    Up { name: String },
    Down { name: String },
    Mtu { name: String, mtu: u32 },
    /// Add an address in addr/prefix form
    AddAddress { name: String, cidr: String },
    RemoveAddress { name: String, cidr: String },
    /// Traffic counters
    Stats { name: String },
}

#[derive(Args)]
struct RuleArgs {
    #[arg(long)]
    priority: Option<u32>,
    #[arg(long)]
    not: bool,
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to: Option<String>,
    #[arg(long)]
    fwmark: Option<String>,
    #[arg(long)]
    iif: Option<String>,
    #[arg(long)]
    oif: Option<String>,
    /// Table to look up
    #[arg(long, conflicts_with_all = ["goto", "action"])]
    lookup: Option<String>,
    /// Priority to jump to
    #[arg(long, conflicts_with = "action")]
    goto: Option<u32>,
    /// unreachable, blackhole, prohibit or nop
    #[arg(long)]
    action: Option<String>,
}

impl RuleArgs {
    fn into_input(self) -> anyhow::Result<IpRuleInput> {
        let action = match (self.lookup, self.goto, self.action.as_deref()) {
            (Some(table), _, _) => Some(RuleAction::Lookup(table)),
            (_, Some(target), _) => Some(RuleAction::Goto(target)),
            (_, _, Some("unreachable")) => Some(RuleAction::Unreachable),
            (_, _, Some("blackhole")) => Some(RuleAction::Blackhole),
            (_, _, Some("prohibit")) => Some(RuleAction::Prohibit),
            (_, _, Some("nop")) => Some(RuleAction::Nop),
            (_, _, Some(other)) => bail!("unknown rule action '{}'", other),
            (None, None, None) => None,
        };

        Ok(IpRuleInput {
            priority: self.priority,
            not: self.not,
            from: self.from,
            to: self.to,
            fwmark: self.fwmark,
            iif: self.iif,
            oif: self.oif,
            action,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    tracing::debug!(
        store_dir = %settings.store_dir.display(),
        config = ?cli.config,
        "settings loaded"
    );
    let engine = PersistEngine::new(SystemRunner::new(), settings, LockRegistry::shared());

    match cli.command {
        Commands::Firewall { action } => handle_firewall(&engine, action, cli.json).await?,
        Commands::Route { action } => handle_route(&engine, action, cli.json).await?,
        Commands::Rule { action } => handle_rule(&engine, action, cli.json).await?,
        Commands::Link { action } => handle_link(action.unwrap_or(LinkAction::List), cli.json).await?,
        Commands::Save => {
            engine.save_all().await.context("snapshot failed")?;
            println!("💾 Saved to {}", engine.settings().store_dir.display());
        }
        Commands::Restore => {
            let report = engine.restore_all().await;
            report.display();
            if report.has_errors() {
                bail!("restore finished with errors");
            }
        }
        Commands::Diff => {
            let drifts = engine.drift_all().await.context("drift check failed")?;
            for drift in &drifts {
                drift.display();
            }
        }
        Commands::Export { output } => {
            let bytes = engine.export_archive().await.context("export failed")?;
            std::fs::write(&output, &bytes)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("📦 Exported {} bytes to {}", bytes.len(), output.display());
        }
        Commands::Import { archive } => import_archive(&engine, &archive).await?,
    }

    Ok(())
}

type Engine = PersistEngine<SystemRunner>;

async fn handle_firewall(engine: &Engine, action: FirewallAction, json: bool) -> anyhow::Result<()> {
    let fw = engine.firewall();

    match action {
        FirewallAction::List { table, chain } => {
            let chains = match chain {
                Some(chain) => vec![fw.get_chain(table, &chain).await?],
                None => fw.list_chains(table).await?,
            };
            if json {
                return print_json(&chains);
            }
            for chain in &chains {
                let policy = chain.policy.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
                println!("📋 {} (policy {}, {} rules)", chain.name, policy, chain.rules.len());
                for rule in &chain.rules {
                    println!(
                        "  {:>3}  {:<10} {:<5} {:<18} {:<18} {}",
                        rule.position, rule.target, rule.protocol, rule.source, rule.destination, rule.extra
                    );
                }
            }
        }
        FirewallAction::Specs { table, chain } => {
            for spec in fw.rule_specs(table, &chain).await? {
                println!("-A {} {}", chain, spec);
            }
        }
        FirewallAction::Add(args) => {
            let input = FirewallRuleInput::from(args);
            fw.add_rule(&input).await?;
            println!("✅ Rule added to {}/{}", input.table, input.chain);
        }
        FirewallAction::Delete { table, chain, position } => {
            fw.delete_rule(table, &chain, position).await?;
            println!("✅ Deleted rule {} from {}/{}", position, table, chain);
        }
        FirewallAction::Move { table, chain, from, to } => {
            fw.move_rule(table, &chain, from, to).await?;
            println!("✅ Moved rule {} to {} in {}/{}", from, to, table, chain);
        }
        FirewallAction::CreateChain { table, chain } => {
            fw.create_chain(table, &chain).await?;
            println!("✅ Created chain {}/{}", table, chain);
        }
        FirewallAction::DeleteChain { table, chain } => {
            fw.delete_chain(table, &chain).await?;
            println!("✅ Deleted chain {}/{}", table, chain);
        }
        FirewallAction::Flush { table, chain } => {
            fw.flush(table, chain.as_deref()).await?;
            println!("✅ Flushed {}/{}", table, chain.as_deref().unwrap_or("*"));
        }
        FirewallAction::Policy { table, chain, policy } => {
            fw.set_policy(table, &chain, policy).await?;
            println!("✅ {}/{} policy set to {}", table, chain, policy);
        }
        FirewallAction::Dump => {
            print!("{}", fw.save_dump().await?);
        }
        FirewallAction::Load { file } => {
            let dump = std::fs::read(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            fw.restore_dump(&dump).await?;
            println!("✅ Ruleset loaded from {}", file.display());
        }
    }

    Ok(())
}

async fn handle_route(engine: &Engine, action: RouteAction, json: bool) -> anyhow::Result<()> {
    let routes = engine.routes();

    match action {
        RouteAction::List { table, all } => {
            let listed = if all {
                routes.list_all().await?
            } else {
                routes.list(&table).await?
            };
            if json {
                return print_json(&listed);
            }
            for route in &listed {
                println!("[{}] {}", route.table, lr_iproute::route::canonical_line(route));
            }
        }
        RouteAction::Add(args) => {
            let input = RouteInput::from(args);
            routes.add(&input).await?;
            println!("✅ Route {} added to table {}", input.destination, input.table_name());
        }
        RouteAction::Delete(args) => {
            let input = RouteInput::from(args);
            routes.delete(&input).await?;
            println!("✅ Route {} deleted from table {}", input.destination, input.table_name());
        }
        RouteAction::Flush { table } => {
            routes.flush(&table).await?;
            println!("✅ Table {} flushed", table);
        }
        RouteAction::Tables => {
            let tables = routes.routing_tables()?;
            if json {
                return print_json(&tables);
            }
            for table in &tables {
                println!("{:>5}  {}", table.id, table.name);
            }
        }
    }

    Ok(())
}

async fn handle_rule(engine: &Engine, action: RuleCommand, json: bool) -> anyhow::Result<()> {
    let rules = engine.rules();

    match action {
        RuleCommand::List => {
            let listed = rules.list().await?;
            if json {
                return print_json(&listed);
            }
            for rule in &listed {
                let marker = if rule.is_reserved() { " (reserved)" } else { "" };
                println!("{}{}", lr_iproute::rule::canonical_line(rule), marker);
            }
        }
        RuleCommand::Add(args) => {
            let input = args.into_input()?;
            rules.add(&input).await?;
            println!("✅ Rule added");
        }
        RuleCommand::Delete { priority } => {
            rules.delete(priority).await?;
            println!("✅ Rule {} deleted", priority);
        }
    }

    Ok(())
}

async fn handle_link(action: LinkAction, json: bool) -> anyhow::Result<()> {
    if let LinkAction::List = action {
        let inventory = LinkCollector::new().await?.collect().await?;
        if json {
            return print_json(&inventory);
        }
        inventory.display();
        return Ok(());
    }

    let control = LinkControl::new().await?;
    match action {
        LinkAction::List => {}
        LinkAction::Up { name } => {
            control.set_up(&name).await?;
            println!("✅ {} is up", name);
        }
        LinkAction::Down { name } => {
            control.set_down(&name).await?;
            println!("✅ {} is down", name);
        }
        LinkAction::Mtu { name, mtu } => {
            control.set_mtu(&name, mtu).await?;
            println!("✅ {} mtu {}", name, mtu);
        }
        LinkAction::AddAddress { name, cidr } => {
            control.add_address(&name, &cidr).await?;
            println!("✅ Added {} to {}", cidr, name);
        }
        LinkAction::RemoveAddress { name, cidr } => {
            if control.remove_address(&name, &cidr).await? {
                println!("✅ Removed {} from {}", cidr, name);
            } else {
                println!("ℹ️  {} is not on {}", cidr, name);
            }
        }
        LinkAction::Stats { name } => {
            let stats = control.stats(&name).await?;
            if json {
                return print_json(&stats);
            }
            stats.display(&name);
        }
    }

    Ok(())
}

async fn import_archive(engine: &Engine, path: &Path) -> anyhow::Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let summary = engine.import_archive(&bytes).await.context("import failed")?;
    println!(
        "📦 Imported {} files and {} directories into {}",
        summary.files,
        summary.directories,
        engine.settings().store_dir.display()
    );
    println!("   Run `lrouter restore` to apply it to the kernel");
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

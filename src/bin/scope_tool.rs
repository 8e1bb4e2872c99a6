use anyhow::{Context, Result, anyhow, ensure};
use clap::{Parser, Subcommand};
use dbscope::memory::{MemorySession, MemoryStore};
use dbscope::{
    Entity, IsolationLevel, JoinMode, ScopeDiagnostic, ScopeError, ScopeFactory, ScopeOptions,
    SessionFactory, SessionRequest,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "scope-tool")]
#[command(about = "Developer tooling for dbscope ambient scopes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs the nested ledger scenario against the in-memory store.
    Demo {
        #[arg(long, default_value_t = 100)]
        opening_balance: i64,
        #[arg(long, default_value_t = 150)]
        new_balance: i64,
        /// Dispose the outer scope first to show the protocol violation.
        #[arg(long)]
        reverse_disposal: bool,
    },
    /// Lists accepted isolation level names.
    IsolationLevels,
    /// Prints the scope options read from the environment.
    Env,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ledger {
    id: u32,
    balance: i64,
}

impl Entity for Ledger {
    fn id(&self) -> String {
        self.id.to_string()
    }

    fn entity_name() -> &'static str {
        "ledger"
    }
}

type LedgerSession = MemorySession<Ledger>;

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Demo {
            opening_balance,
            new_balance,
            reverse_disposal,
        } => run_demo(opening_balance, new_balance, reverse_disposal),
        Command::IsolationLevels => {
            for level in IsolationLevel::ALL {
                println!("{}", level);
            }
            Ok(())
        }
        Command::Env => {
            let options = ScopeOptions::from_env().context("Invalid scope options in environment")?;
            println!("join mode:       {}", options.join_mode);
            println!("read only:       {}", options.read_only);
            match options.isolation_level {
                Some(level) => println!("isolation level: {}", level),
                None => println!("isolation level: (none)"),
            }
            Ok(())
        }
    }
}

fn run_demo(opening_balance: i64, new_balance: i64, reverse_disposal: bool) -> Result<()> {
    let store = MemoryStore::new();
    let diagnostic = ScopeDiagnostic::new();
    let sessions = {
        let store = store.clone();
        SessionFactory::new().register(move |req: &SessionRequest| {
            Ok(LedgerSession::open(&store, req.read_only))
        })
    };
    let factory = ScopeFactory::new(sessions).with_diagnostic(diagnostic.clone());

    let outer = factory.create(JoinMode::ForceCreateNew)?;
    let outer_session = outer.get::<LedgerSession>()?;
    outer_session.set::<Ledger>().add(Ledger {
        id: 1,
        balance: opening_balance,
    })?;
    println!("scope A {} opened, ledger #1 added with balance {}", outer.id(), opening_balance);

    let inner = factory.create(JoinMode::JoinExisting)?;
    let inner_session = inner.get::<LedgerSession>()?;
    ensure!(
        Arc::ptr_eq(&outer_session, &inner_session),
        "nested scope did not share the outer session"
    );
    println!("scope B {} joined A (nested: {})", inner.id(), inner.is_nested());

    let ledger = inner_session
        .set::<Ledger>()
        .find("1")?
        .ok_or_else(|| anyhow!("ledger #1 is not cached"))?;
    ledger
        .write()
        .map_err(|_| anyhow!("ledger lock poisoned"))?
        .balance = new_balance;

    println!("B.commit() -> {}", inner.commit()?);
    println!("A.commit() -> {}", outer.commit()?);

    if reverse_disposal {
        report("A.dispose()", outer.dispose());
        report("B.dispose()", inner.dispose());
    } else {
        report("B.dispose()", inner.dispose());
        report("A.dispose()", outer.dispose());
    }

    let stored = store
        .load::<Ledger>("1")?
        .ok_or_else(|| anyhow!("ledger #1 was not persisted"))?;
    println!("stored balance: {}", stored.balance);
    println!("diagnostic trace: {}", diagnostic.called_methods().join(", "));
    Ok(())
}

fn report(label: &str, outcome: dbscope::Result<()>) {
    match outcome {
        Ok(()) => println!("{} -> ok", label),
        Err(err @ (ScopeError::OutOfOrderDisposal | ScopeError::ParentScopeDisposed(_))) => {
            println!("{} -> protocol violation", label);
            eprintln!("{}", err);
        }
        Err(err) => println!("{} -> error: {}", label, err),
    }
}

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::BufRead;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

use flock::api::{MemberQuery, StatsPeriod};
use flock::config::Config;
use flock::hooks::QueryState;
use flock::offline::FeedState;
use flock::AppContext;

const PASSWORD_ENV: &str = "FLOCK_PASSWORD";

#[derive(Parser, Debug)]
#[command(name = "flock")]
#[command(about = "Command-line client for the Flock church management API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/flock/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Backend base URL, overrides the config file and FLOCK_API_URL
  #[arg(long)]
  api_url: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Sign in; the password is read from FLOCK_PASSWORD or stdin
  Login { email: String },
  Logout,
  /// Show the signed-in user and role
  Whoami,
  /// Statistics, recent members and upcoming events
  Dashboard {
    /// Keep running and print every background refresh
    #[arg(long)]
    watch: bool,
  },
  /// List members
  Members {
    #[arg(long)]
    search: Option<String>,
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    page: Option<u32>,
  },
  /// Period statistics
  Reports {
    #[arg(long, default_value = "month")]
    period: StatsPeriod,
  },
  /// Public events, served from the saved copy when offline
  Events {
    #[arg(long)]
    watch: bool,
  },
  /// Import members from a CSV file with a header row
  Import {
    file: PathBuf,
    #[arg(long)]
    batch_size: Option<usize>,
  },
}

fn read_password() -> Result<String> {
  if let Ok(password) = std::env::var(PASSWORD_ENV) {
    return Ok(password);
  }
  eprint!("Password: ");
  let mut line = String::new();
  std::io::stdin().lock().read_line(&mut line)?;
  Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn print_feed(state: &FeedState) {
  match state {
    FeedState::Loading => println!("Loading events..."),
    FeedState::Disconnected { notice } => println!("{}", notice),
    FeedState::Fresh { events, .. } | FeedState::Stale { events, .. } => {
      if let FeedState::Stale { notice, saved_at, .. } = state {
        println!("{} (saved {})", notice, saved_at.format("%Y-%m-%d %H:%M"));
      }
      for event in events {
        let when = event
          .start_datetime
          .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
          .unwrap_or_default();
        println!("{:>6}  {:<16}  {}", event.id, when, event.title);
      }
    }
  }
}

async fn run(ctx: AppContext, command: Command) -> Result<()> {
  match command {
    Command::Login { email } => {
      let password = read_password()?;
      let outcome = ctx.auth.login(&email, &password).await.map_err(|e| eyre!(e))?;
      println!("Signed in as {} ({})", outcome.user.display_name(), outcome.user.role);
    }
    Command::Logout => {
      ctx.auth.logout().await;
      println!("Signed out");
    }
    Command::Whoami => match ctx.auth.user() {
      Some(user) => println!("{} <{}> ({})", user.display_name(), user.email, user.role),
      None => println!("Not signed in"),
    },
    Command::Dashboard { watch } => {
      let _monitor = ctx.spawn_refresh_monitor();
      let mut dashboard = ctx.dashboard();
      dashboard.load().await;
      let state = dashboard.state();
      print_json(&state)?;
      print_json(&state.data.metrics())?;

      if watch {
        dashboard.start_auto_refresh();
        let mut updates = dashboard.subscribe();
        loop {
          tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
              if changed.is_err() {
                break;
              }
              let state = updates.borrow_and_update().clone();
              if !state.refreshing && !state.loading {
                print_json(&state)?;
              }
            }
          }
        }
      }
    }
    Command::Members {
      search,
      status,
      page,
    } => {
      let mut members = ctx.members_list(MemberQuery {
        search,
        status,
        page,
        ..MemberQuery::default()
      });
      members.load();
      match members.settle().await {
        QueryState::Success(page) => {
          for member in &page.results {
            println!(
              "{:>6}  {:<28}  {:<32}  {}",
              member.id,
              format!("{} {}", member.first_name, member.last_name),
              member.email.as_deref().unwrap_or("-"),
              member.status
            );
          }
          println!("{} of {} members", page.results.len(), page.count);
        }
        QueryState::Error(e) => return Err(eyre!(e.clone())),
        QueryState::Idle | QueryState::Loading => {}
      }
    }
    Command::Reports { period } => {
      let reports = ctx.reports(period);
      reports.load(flock::hooks::LoadMode::Initial).await;
      let state = reports.state();
      if let Some(error) = &state.error {
        return Err(eyre!(error.clone()));
      }
      print_json(&state.data)?;
      print_json(&state.data.metrics())?;
    }
    Command::Events { watch } => {
      let feed = ctx.events_feed();
      if watch {
        let cancel = CancellationToken::new();
        let mut updates = feed.subscribe();
        let printer = tokio::spawn(async move {
          while updates.changed().await.is_ok() {
            let status = updates.borrow_and_update().clone();
            print_feed(&status.feed);
          }
        });
        tokio::select! {
          _ = feed.run(cancel.clone()) => {}
          _ = tokio::signal::ctrl_c() => cancel.cancel(),
        }
        printer.abort();
      } else {
        feed.refresh().await;
        print_feed(&feed.status().feed);
      }
    }
    Command::Import { file, batch_size } => {
      let reader = std::fs::File::open(&file)
        .map_err(|e| eyre!("Failed to open {}: {}", file.display(), e))?;
      let report = ctx.import_csv(reader, batch_size).await?;
      print_json(&report)?;
    }
  }
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let config = match args.api_url {
    Some(base_url) => Config {
      api: flock::config::ApiConfig {
        base_url,
        ..config.api
      },
      ..config
    },
    None => config,
  };

  let _guard = flock::logging::init(&config.logging)?;
  info!(base_url = %config.api.base_url, "Starting");

  let ctx = AppContext::new(config)?;
  run(ctx, args.command).await
}

use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use wager_client::{
    backend::{
        BetApi,
        LedgerApi,
        MatchApi,
        in_memory::InMemoryBackend,
        rest::RestBackend,
    },
    client::{
        self,
        AppController,
    },
    config::{
        ClientConfig,
        ConfigStore,
    },
    controller::{
        BetController,
        CreateBetRequest,
    },
    session::SessionStore,
    types::{
        BetId,
        BetStatus,
        MatchId,
        PickId,
        StraightBet,
    },
};

const DEFAULT_CLI_LIMIT: usize = 20;

enum Command {
    Tui,
    Balance,
    History(usize),
    Open(usize),
    Bets(BetStatus, usize),
    Mine(Option<BetStatus>),
    Create {
        match_id: String,
        pick_id: String,
        amount: i64,
        note: Option<String>,
    },
    Accept(String),
    Cancel(String),
}

struct Cli {
    config_path: Option<String>,
    offline: bool,
    email: Option<String>,
    command: Command,
}

fn print_usage_and_exit() -> ! {
    println!(
        "Usage: wager-client [--config <path>] [--offline] [--email <address>] [command]\n\
         \n\
         Flags:\n\
           --config <path>     Config file (defaults to ~/.wager-client/config.json)\n\
           --offline           Use the built-in demo backend instead of the hosted one\n\
           --email <address>   Account to sign in with (saved to the config file)\n\
         \n\
         Commands:\n\
           tui                           Interactive terminal UI (default)\n\
           balance                       Show free and reserved points\n\
           history [limit]               Points transactions, newest first\n\
           open [limit]                  Open bets\n\
           bets <status> [limit]         Bets with status open|waiting_result|completed|cancelled\n\
           mine [status]                 Bets you created or accepted\n\
           create <match> <pick> <amount> [note...]\n\
           accept <bet-id>\n\
           cancel <bet-id>"
    );
    std::process::exit(0);
}

fn parse_limit(raw: Option<String>) -> Result<usize> {
    match raw {
        None => Ok(DEFAULT_CLI_LIMIT),
        Some(raw) => raw
            .parse()
            .map_err(|_| eyre!("Invalid limit '{raw}', expected a number")),
    }
}

fn parse_status(raw: &str) -> Result<BetStatus> {
    raw.parse().map_err(|e: String| eyre!(e))
}

fn parse_command(mut args: impl Iterator<Item = String>) -> Result<Command> {
    let Some(name) = args.next() else {
        return Ok(Command::Tui);
    };
    let command = match name.as_str() {
        "tui" => Command::Tui,
        "balance" => Command::Balance,
        "history" => Command::History(parse_limit(args.next())?),
        "open" => Command::Open(parse_limit(args.next())?),
        "bets" => {
            let status = args
                .next()
                .ok_or_else(|| eyre!("bets requires a status argument"))?;
            Command::Bets(parse_status(&status)?, parse_limit(args.next())?)
        }
        "mine" => Command::Mine(args.next().as_deref().map(parse_status).transpose()?),
        "create" => {
            let match_id = args
                .next()
                .ok_or_else(|| eyre!("create requires a match id"))?;
            let pick_id = args
                .next()
                .ok_or_else(|| eyre!("create requires a pick id"))?;
            let raw_amount = args
                .next()
                .ok_or_else(|| eyre!("create requires an amount"))?;
            let amount = raw_amount
                .parse()
                .map_err(|_| eyre!("Invalid amount '{raw_amount}'"))?;
            let note = args.by_ref().collect::<Vec<_>>().join(" ");
            Command::Create {
                match_id,
                pick_id,
                amount,
                note: (!note.is_empty()).then_some(note),
            }
        }
        "accept" => Command::Accept(
            args.next()
                .ok_or_else(|| eyre!("accept requires a bet id"))?,
        ),
        "cancel" => Command::Cancel(
            args.next()
                .ok_or_else(|| eyre!("cancel requires a bet id"))?,
        ),
        other => return Err(eyre!("Unknown command: {other}")),
    };
    if let Some(extra) = args.next() {
        return Err(eyre!("Unexpected argument: {extra}"));
    }
    Ok(command)
}

fn parse_cli_args() -> Result<Cli> {
    let mut args = std::env::args().skip(1).peekable();
    let mut config_path: Option<String> = None;
    let mut offline = false;
    let mut email: Option<String> = None;

    while let Some(arg) = args.next_if(|arg| arg.starts_with('-')) {
        match arg.as_str() {
            "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| eyre!("--config requires a path argument"))?;
                if config_path.is_some() {
                    return Err(eyre!("--config may only be specified once"));
                }
                config_path = Some(path);
            }
            "--offline" => offline = true,
            "--email" => {
                let address = args
                    .next()
                    .ok_or_else(|| eyre!("--email requires an address"))?;
                if email.is_some() {
                    return Err(eyre!("--email may only be specified once"));
                }
                email = Some(address);
            }
            "--help" | "-h" => print_usage_and_exit(),
            other => return Err(eyre!("Unknown argument: {other}")),
        }
    }

    Ok(Cli {
        config_path,
        offline,
        email,
        command: parse_command(args)?,
    })
}

async fn print_bets<B, L, M>(
    controller: &BetController<B, L, M>,
    bets: &[StraightBet],
) where
    B: BetApi,
    L: LedgerApi,
    M: MatchApi,
{
    if bets.is_empty() {
        println!("No bets");
        return;
    }
    for bet in bets {
        let pick = controller
            .matches()
            .resolve_pick_name(&bet.match_id, &bet.creators_pick_id)
            .await;
        let note = bet.note.as_deref().unwrap_or("");
        println!(
            "{}  {:<14} {:<10} {:>7}  {} by {}  {}",
            bet.id, bet.status, bet.match_id, bet.amount, pick, bet.creator_username, note
        );
    }
}

async fn execute<B, L, M>(
    command: Command,
    controller: BetController<B, L, M>,
    config: &ClientConfig,
) -> Result<()>
where
    B: BetApi,
    L: LedgerApi,
    M: MatchApi,
{
    match command {
        Command::Tui => {
            let app = AppController::new(controller, config.poll_interval());
            client::run_app(app).await
        }
        Command::Balance => {
            let balances = controller.ledger().get_balances().await?;
            println!(
                "Free: {}  Reserved: {}  Total: {}",
                balances.free,
                balances.reserved,
                balances.total()
            );
            Ok(())
        }
        Command::History(limit) => {
            let history = controller.ledger().history(limit).await?;
            if history.is_empty() {
                println!("No transactions");
            }
            for tx in history {
                let bet = tx.bet_id.map(|id| id.to_string()).unwrap_or_default();
                println!(
                    "{}  {:+8}  {:?}  {}",
                    tx.created_at.format("%Y-%m-%d %H:%M"),
                    tx.amount,
                    tx.kind,
                    bet
                );
            }
            Ok(())
        }
        Command::Open(limit) => {
            let bets = controller.bets().list_open(limit).await?;
            print_bets(&controller, &bets).await;
            Ok(())
        }
        Command::Bets(status, limit) => {
            let bets = controller.bets().list_by_status(status, limit).await?;
            print_bets(&controller, &bets).await;
            Ok(())
        }
        Command::Mine(status) => {
            let session = controller.sessions().require()?;
            let bets = controller
                .bets()
                .list_by_user(&session.user_id, status, config.list_limit())
                .await?;
            print_bets(&controller, &bets).await;
            Ok(())
        }
        Command::Create {
            match_id,
            pick_id,
            amount,
            note,
        } => {
            let bet = controller
                .create_bet(CreateBetRequest {
                    match_id: MatchId::new(match_id),
                    pick_id: PickId::new(pick_id),
                    amount: Some(amount),
                    note,
                })
                .await?;
            println!("Created bet {} for {} points", bet.id, bet.amount);
            Ok(())
        }
        Command::Accept(id) => {
            controller.accept_bet(&BetId::new(id.clone())).await?;
            println!("Accepted bet {id}");
            Ok(())
        }
        Command::Cancel(id) => {
            controller.cancel_bet(&BetId::new(id.clone())).await?;
            println!("Cancelled bet {id}");
            Ok(())
        }
    }
}

async fn run_online(cli: Cli, store: &ConfigStore, mut config: ClientConfig) -> Result<()> {
    let (url, api_key) = config.remote()?;
    let sessions = SessionStore::new();
    let backend = RestBackend::new(url, api_key, sessions.clone())?;

    let email = cli
        .email
        .clone()
        .or_else(|| config.email.clone())
        .ok_or_else(|| eyre!("Specify --email <address> to sign in"))?;
    let password = rpassword::prompt_password(format!("Password for {email}: "))
        .wrap_err("Failed to read password")?;
    let session = backend
        .sign_in_with_password(&email, &password)
        .await
        .wrap_err("Sign-in failed")?;
    sessions.sign_in(session);

    if config.email.as_deref() != Some(email.as_str()) {
        config.email = Some(email);
        store.save(&config)?;
    }

    let controller = BetController::new(
        sessions,
        backend.clone(),
        backend.clone(),
        backend,
        config.list_limit(),
    );
    execute(cli.command, controller, &config).await
}

async fn run_offline(cli: Cli, config: ClientConfig) -> Result<()> {
    let (backend, session) = InMemoryBackend::demo().await;
    tracing::info!(user_id = %session.user_id, "running against the offline demo backend");
    let sessions = SessionStore::with_session(session);
    let controller = BetController::new(
        sessions,
        backend.clone(),
        backend.clone(),
        backend,
        config.list_limit(),
    );
    execute(cli.command, controller, &config).await
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = parse_cli_args()?;
    let store = ConfigStore::open(cli.config_path.as_deref())?;
    let config = store.load()?.with_env_overrides();
    let _log_guard = wager_client::init_tracing(&config.log_dir()?)?;
    tracing::info!(config = %store.path().display(), "starting wager-client");

    if cli.offline {
        run_offline(cli, config).await
    } else {
        run_online(cli, &store, config).await
    }
}

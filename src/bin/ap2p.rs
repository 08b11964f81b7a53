//! Command-line front-end (§6.1). A thin convenience harness over the
//! `ap2p` library: one `argh` subcommand per operation of §6, no business
//! logic of its own. Exit code `0` on success, `1` on any error — the
//! status-code convention of §6 folded to the process boundary the way the
//! original implementation folds every failure path to `return -1;`.

use std::process::ExitCode;

use argh::FromArgs;

use ap2p::clock::SystemClock;
use ap2p::model::ContentType;
use ap2p::protocol::Dispatcher;
use ap2p::rand::FastrandIdSource;
use ap2p::store::{Store, DEFAULT_DB_FILE};
use ap2p::Error;

#[derive(FromArgs)]
/// a peer-to-peer messaging daemon
struct Cli {
    /// path to the store file (default: ap2p_storage.db)
    #[argh(option)]
    db: Option<String>,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    ListConnections(ListConnections),
    ListMessages(ListMessages),
    Request(Request),
    Decide(Decide),
    Select(Select),
    Send(Send),
    Listen(Listen),
    Get(Get),
    Set(Set),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "list-connections")]
/// list every known connection
struct ListConnections {}

#[derive(FromArgs)]
#[argh(subcommand, name = "list-messages")]
/// list every stored message
struct ListMessages {}

#[derive(FromArgs)]
#[argh(subcommand, name = "request")]
/// request a connection to a peer
struct Request {
    #[argh(positional)]
    addr: String,
    #[argh(positional)]
    port: u16,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "decide")]
/// accept or reject a connection awaiting our review
struct Decide {
    #[argh(positional)]
    conn_id: i64,
    /// "accept" or "reject"
    #[argh(positional)]
    decision: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "select")]
/// select a connection as the target of `send`
struct Select {
    #[argh(positional)]
    conn_id: i64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "send")]
/// send a text message on the selected connection
struct Send {
    #[argh(positional)]
    content: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "listen")]
/// run the listener until standard input receives a byte
struct Listen {}

#[derive(FromArgs)]
#[argh(subcommand, name = "get")]
/// read a State key
struct Get {
    #[argh(positional)]
    key: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "set")]
/// write a State key
struct Set {
    #[argh(positional)]
    key: String,
    #[argh(positional)]
    value: String,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli: Cli = argh::from_env();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    let db_path = cli.db.unwrap_or_else(|| DEFAULT_DB_FILE.to_string());
    let store = Store::open(&db_path)?;
    let ids = FastrandIdSource;
    let clock = SystemClock;
    let dispatcher = Dispatcher::new(&store, &ids, &clock);

    match cli.command {
        Command::ListConnections(_) => {
            for conn in dispatcher.list_connections()? {
                println!(
                    "{}\t{:?}\t{}:{}\t{}",
                    conn.conn_id,
                    conn.status,
                    conn.peer_addr,
                    conn.peer_port,
                    conn.peer_name.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        Command::ListMessages(_) => {
            for msg in dispatcher.list_messages()? {
                println!(
                    "{}\t{}\t{}\t{}",
                    msg.conn_id,
                    msg.shared_msg_id,
                    msg.time_sent,
                    String::from_utf8_lossy(&msg.content)
                );
            }
            Ok(())
        }
        Command::Request(args) => dispatcher.request_connection(&args.addr, args.port),
        Command::Decide(args) => {
            let accept = match args.decision.as_str() {
                "accept" => true,
                "reject" => false,
                other => {
                    return Err(Error::Config(format!(
                        "decision must be 'accept' or 'reject', got '{other}'"
                    )))
                }
            };
            dispatcher.decide_on_connection(args.conn_id, accept)
        }
        Command::Select(args) => dispatcher.select_connection(args.conn_id),
        Command::Send(args) => {
            dispatcher.send_message(ContentType::Text, args.content.as_bytes())
        }
        Command::Listen(_) => {
            let listen_addr = dispatcher
                .state_get("listen_addr")?
                .ok_or_else(|| Error::Config("missing state key: listen_addr".into()))?;
            let self_port: u16 = dispatcher
                .state_get("self_port")?
                .ok_or_else(|| Error::Config("missing state key: self_port".into()))?
                .parse()
                .map_err(|_| Error::Config("malformed self_port value".into()))?;
            ap2p::listener::listen(&store, &listen_addr, self_port)
        }
        Command::Get(args) => {
            match dispatcher.state_get(&args.key)? {
                Some(value) => println!("{value}"),
                None => println!("<unset>"),
            }
            Ok(())
        }
        Command::Set(args) => dispatcher.state_set(&args.key, &args.value),
    }
}

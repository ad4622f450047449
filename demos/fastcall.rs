// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;
use std::process;
use std::sync::Mutex;
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use futures::StreamExt;
use serde_json::Value;
use slog::{info, o, Drain, Level, LevelFilter, Logger};
use tokio::net::TcpStream;

use fast_rpc::{FastClient, RpcOptions};

static APP: &'static str = "fastcall";
static DEFAULT_HOST: &'static str = "127.0.0.1";
const DEFAULT_PORT: u32 = 2030;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for making a node-fast RPC method call")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote server")
                .long("host")
                .short("h")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for remote server (Default: 2030)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("method")
                .help("Name of remote RPC method call")
                .long("method")
                .short("m")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("args")
                .help("JSON-encoded array of arguments for RPC method call")
                .long("args")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("timeout")
                .help("Fail the request after this many milliseconds")
                .long("timeout")
                .short("t")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("abandon")
                .help("Abandon the request right after issuing it")
                .long("abandon-immediately")
                .short("a")
                .takes_value(false),
        )
        .arg(
            Arg::with_name("leave_open")
                .help("Keep the connection open until interrupted")
                .long("leave-conn-open")
                .short("c")
                .takes_value(false),
        )
        .arg(
            Arg::with_name("verbose")
                .help("Log client activity to stderr")
                .long("verbose")
                .short("v")
                .takes_value(false),
        )
        .get_matches()
}

fn make_logger(verbose: bool) -> Logger {
    let level = if verbose { Level::Trace } else { Level::Warning };
    let plain = slog_term::PlainSyncDecorator::new(std::io::stderr());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            level,
        ))
        .fuse(),
        o!("build-id" => crate_version!()),
    )
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let addr = [host, String::from(":"), port.to_string()]
        .concat()
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!(
                "Failed to parse host and port as valid socket address: \
                 {}",
                e
            );
            process::exit(1)
        });
    let method =
        String::from(matches.value_of("method").unwrap_or_else(|| {
            eprintln!("Failed to parse method argument as String");
            process::exit(1)
        }));
    let args = match value_t!(matches, "args", Value).unwrap_or_else(|e| e.exit()) {
        Value::Array(args) => args,
        _ => {
            eprintln!("RPC arguments must be a JSON array");
            process::exit(2)
        }
    };

    let mut options = RpcOptions::new();
    if matches.is_present("timeout") {
        let ms = value_t!(matches, "timeout", u64).unwrap_or_else(|e| e.exit());
        options = options.timeout(Duration::from_millis(ms));
    }

    let log = make_logger(matches.is_present("verbose"));

    let stream = TcpStream::connect(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to connect to server: {}", e);
        process::exit(1)
    });
    info!(log, "connected"; "addr" => %addr);

    let client = FastClient::new(stream, Some(&log));
    let mut request = client.rpc(&method, args, options);
    if matches.is_present("abandon") {
        request.abandon();
    }

    let mut failed = false;
    while let Some(item) = request.next().await {
        match item {
            Ok(value) => println!("{}", value),
            Err(e) => {
                eprintln!("Error: {}", e);
                failed = true;
            }
        }
    }

    if matches.is_present("leave_open") {
        eprintln!("leaving connection open; interrupt to exit");
        if let Err(e) = tokio::signal::ctrl_c().await {
            eprintln!("Failed to wait for interrupt: {}", e);
        }
    }

    client.detach();
    if failed {
        process::exit(1);
    }
}

//! Small client for a running matter-server: finds it over mDNS, sends a
//! few commands and prints everything the server sends back.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use matter_server::config::DEFAULT_PORT;
use matter_server::mdns::{self, zone::DEFAULT_HOSTNAME};
use matter_server::models::CommandMessage;

const DEFAULT_COMMANDS: &[&str] = &["server_info", "diagnostics", "get_nodes", "start_listening"];

#[derive(Parser, Debug)]
#[command(name = "matter-client", about = "Example matter-server client")]
struct Cli {
    #[clap(long)]
    #[arg(default_value_t = false)]
    verbose: bool,

    /// Server address; discovered over mDNS when omitted
    #[clap(long)]
    host: Option<IpAddr>,

    #[clap(long)]
    #[arg(default_value_t = DEFAULT_PORT as u16)]
    port: u16,

    /// mDNS name of the server
    #[clap(long)]
    #[arg(default_value_t = format!("{}.local", DEFAULT_HOSTNAME))]
    hostname: String,

    /// Seconds to wait for the mDNS answer
    #[clap(long)]
    #[arg(default_value_t = 5)]
    timeout: u64,

    /// Seconds to keep printing results and events after the last command
    #[clap(long)]
    #[arg(default_value_t = 10)]
    listen: u64,

    /// Commands to send, in order
    commands: Vec<String>,
}

async fn discover(hostname: &str, timeout: Duration) -> IpAddr {
    println!("discovering {} via mdns...", hostname);
    let target = SocketAddr::from((mdns::MDNS_GROUP_V4, mdns::MDNS_PORT));
    match mdns::resolve_host(target, hostname, timeout).await {
        Ok(Some(ip)) => {
            println!("found {} at {}", hostname, ip);
            return ip;
        }
        Ok(None) => println!("no mdns answer within {:?}", timeout),
        Err(e) => println!("mdns query failed: {:#}", e),
    }
    println!("trying localhost");
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn print_frame(text: &str) {
    // the server may batch several JSON messages into one frame
    for line in text.split('\n').filter(|l| !l.trim().is_empty()) {
        let v: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                println!("unparsable message ({}): {}", e, line);
                continue;
            }
        };
        if let Some(code) = v.get("error_code") {
            println!(
                "command failed [{}]: error {} - {}",
                v["message_id"].as_str().unwrap_or(""),
                code,
                v["details"].as_str().unwrap_or("unknown error")
            );
        } else if v.get("result").is_some() {
            println!(
                "command success [{}]: {}",
                v["message_id"].as_str().unwrap_or(""),
                v["result"]
            );
        } else if let Some(event) = v.get("event") {
            println!("event {}: {}", event, v["data"]);
        } else if v.get("fabric_id").is_some() {
            println!("server info: {}", v);
        } else {
            println!("message: {}", v);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = if cli.verbose {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Error
    };
    env_logger::Builder::new()
        .parse_default_env()
        .target(env_logger::Target::Stdout)
        .filter_level(log_level)
        .format_line_number(true)
        .format_file(true)
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .init();

    let host = match cli.host {
        Some(host) => host,
        None => discover(&cli.hostname, Duration::from_secs(cli.timeout)).await,
    };
    let url = format!("ws://{}/ws", SocketAddr::new(host, cli.port));
    println!("connecting to {}", url);
    let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .context(format!("failed to connect to {}", url))?;
    let (mut sink, mut stream) = stream.split();

    let reader = tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => print_frame(text.as_str()),
                Ok(Message::Close(frame)) => {
                    println!("server closed connection {:?}", frame);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    println!("read error: {}", e);
                    break;
                }
            }
        }
    });

    let commands: Vec<String> = if cli.commands.is_empty() {
        DEFAULT_COMMANDS.iter().map(|c| c.to_string()).collect()
    } else {
        cli.commands
    };
    for command in commands {
        let msg = CommandMessage::new(&command);
        println!("sending {} [{}]", command, msg.message_id);
        sink.send(Message::text(serde_json::to_string(&msg)?)).await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    println!("listening for {} seconds...", cli.listen);
    let _ = tokio::time::timeout(Duration::from_secs(cli.listen), async {
        tokio::select! {
            _ = reader => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    })
    .await;

    let _ = sink.send(Message::Close(None)).await;
    Ok(())
}

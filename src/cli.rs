use std::fs;
use std::io::{self, Write};
use std::net::TcpStream;

use clap::Parser;
use trackdb::parser::{self, Command};
use trackdb::server::{
    call, OP_COMPACT, OP_LAST_KNOWN, OP_METADATA, OP_POPULATE, OP_PURGE_TESTING, OP_VISITS, STATUS_OK,
};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Interactive shell for a trackdb node", long_about = None)]
struct Args {
    #[clap(long, default_value = "127.0.0.1:9000")]
    addr: String,
}

fn main() {
    let args = Args::parse();
    print_banner();

    let mut stream = match TcpStream::connect(&args.addr) {
        Ok(s) => {
            println!("[\u{2713}] Connected to trackdb at {}!", args.addr);
            s
        }
        Err(_) => {
            println!("[\u{2717}] Could not connect to server at {}.", args.addr);
            println!("    Make sure to run 'cargo run --release --bin trackdb' in another terminal.");
            return;
        }
    };
    println!("Type 'HELP' for supported commands or 'EXIT' to quit.\n");

    let stdin = io::stdin();
    let mut buffer = String::new();

    loop {
        print!("trackdb> ");
        if io::stdout().flush().is_err() {
            break;
        }
        buffer.clear();

        match stdin.read_line(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        if buffer.trim().is_empty() { continue; }

        match parser::parse_command(&buffer) {
            Ok(Command::Exit) => break,
            Ok(cmd) => {
                if let Err(e) = execute_command(&mut stream, cmd) {
                    println!("[\u{26a0}\u{fe0f} Error] {}", e);
                }
            }
            Err(e) => {
                println!("[\u{2717} Syntax Error] {}", e);
                if buffer.to_uppercase().starts_with("VISITS") {
                    println!("    \u{2139}\u{fe0f}  Hint: Try 'VISITS IN BBOX (44, -94) (46, -92) NAMES 'rye' PAGE 0..10'");
                }
            }
        }
    }
}

fn print_banner() {
    println!("\n==================================================");
    println!("   trackdb CLI - location track store");
    println!("==================================================\n");
}

fn print_help() {
    println!("\n--- Available Commands ---");
    println!("1. POPULATE:    POPULATE 'tracks.json'");
    println!("2. LAST KNOWN:  LASTKNOWN");
    println!("3. VISITS:      VISITS [IN BBOX (lat, lng) (lat, lng)] [NAMES 'a', 'b'] [UUIDS 'u']");
    println!("                       [SINCE unix] [UNTIL unix] [PAGE start..end] [REVERSE]");
    println!("4. METADATA:    METADATA");
    println!("5. COMPACT:     COMPACT");
    println!("6. PURGE:       PURGE TESTING");
    println!("7. EXIT:        Quit\n");
}

fn execute_command(stream: &mut TcpStream, cmd: Command) -> Result<(), String> {
    let (op, payload) = match cmd {
        Command::Help => { print_help(); return Ok(()) },
        Command::Exit => return Ok(()),
        Command::Populate { path } => {
            let bytes = fs::read(&path).map_err(|e| format!("{}: {}", path, e))?;
            (OP_POPULATE, bytes)
        },
        Command::LastKnown => (OP_LAST_KNOWN, Vec::new()),
        Command::Visits(filter) => {
            let body = serde_json::to_vec(&filter).map_err(|e| e.to_string())?;
            (OP_VISITS, body)
        },
        Command::Metadata => (OP_METADATA, Vec::new()),
        Command::Compact => (OP_COMPACT, Vec::new()),
        Command::PurgeTesting => (OP_PURGE_TESTING, Vec::new()),
    };

    let (status, body) = call(stream, op, &payload).map_err(|e| e.to_string())?;
    if status != STATUS_OK {
        return Err(String::from_utf8_lossy(&body).into_owned());
    }

    match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(v) => println!("{}", serde_json::to_string_pretty(&v).unwrap_or_else(|_| v.to_string())),
        Err(_) => println!("{}", String::from_utf8_lossy(&body)),
    }
    Ok(())
}

//! QuorumSQL CLI Client
//!
//! Interactive SQL shell speaking the wire protocol.

use std::io::{BufRead, Write};

use clap::Parser;
use quorumsql::client::Client;
use quorumsql::engine::Value;
use quorumsql::error::Result;

/// QuorumSQL CLI
#[derive(Parser, Debug)]
#[command(name = "quorumsql-cli")]
#[command(about = "SQL shell for QuorumSQL")]
#[command(version)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:7450")]
    server: String,

    /// Database to open
    #[arg(short, long, default_value = "main")]
    database: String,

    /// Run a single statement and exit instead of starting a shell
    #[arg(short, long)]
    execute: Option<String>,
}

fn main() {
    let args = Args::parse();

    let (mut client, db_id) = match connect(&args) {
        Ok(bound) => bound,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    if let Some(sql) = &args.execute {
        if let Err(e) = run_statement(&mut client, db_id, sql) {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
        return;
    }

    println!("QuorumSQL v{} connected to {}", quorumsql::VERSION, args.server);
    println!("Type SQL statements, or .quit to exit.");

    let stdin = std::io::stdin();
    loop {
        print!("{}> ", args.database);
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("error: {e}");
                break;
            }
        }

        let sql = line.trim();
        if sql.is_empty() {
            continue;
        }
        if sql == ".quit" || sql == ".exit" {
            break;
        }

        if let Err(e) = run_statement(&mut client, db_id, sql) {
            eprintln!("error: {e}");
        }
    }
}

fn connect(args: &Args) -> Result<(Client, u32)> {
    let mut client = Client::connect(&args.server)?;
    client.handshake()?;
    let db_id = client.open(&args.database)?;
    Ok((client, db_id))
}

/// Prepare a statement and run it down the right path based on the
/// server's static analysis
fn run_statement(client: &mut Client, db_id: u32, sql: &str) -> Result<()> {
    let stmt = client.prepare(db_id, sql)?;

    if stmt.mutates {
        let result = client.exec(stmt.id, &[])?;
        println!(
            "ok (rows affected: {}, last insert id: {})",
            result.rows_affected, result.last_insert_id
        );
    } else {
        let result = client.query(stmt.id, &[])?;
        println!("{}", result.columns.join(" | "));
        for row in &result.rows {
            let rendered: Vec<String> = row.iter().map(render_value).collect();
            println!("{}", rendered.join(" | "));
        }
        println!("({} rows)", result.rows.len());
    }

    client.finalize(stmt.id)
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => s.clone(),
        Value::Blob(b) => format!("x'{}'", b.iter().map(|b| format!("{b:02x}")).collect::<String>()),
    }
}

//! Render a conditional SQL template against a parameter map and run the
//! statement-safety check, printing the final SQL and bound parameters.
//! Useful for debugging templates the query builder produced.

use anyhow::{Context, Result};
use chartsmith::safety::validate_statement;
use chartsmith::template::render_query;
use clap::Parser;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "render")]
#[command(about = "Render a conditional SQL template and safety-check the result")]
struct Args {
    /// Path to the template file
    template: PathBuf,

    /// JSON object of raw parameter values, e.g. '{"status": "Shipped"}'
    #[arg(short, long, default_value = "{}")]
    params: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let template = std::fs::read_to_string(&args.template)
        .with_context(|| format!("failed to read {}", args.template.display()))?;
    let params: HashMap<String, Value> =
        serde_json::from_str(&args.params).context("params must be a JSON object")?;

    let (sql, bound) = render_query(&template, &params)?;
    validate_statement(&sql)?;

    println!("{}", sql);
    println!("-- bound params: {}", serde_json::to_string(&bound)?);
    Ok(())
}

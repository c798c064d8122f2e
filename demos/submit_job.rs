//! Submit a shell job and poll it until it finishes.
//!
//! ```text
//! cargo run --example submit_job -- --workflow echo --command "echo hello"
//! ```

use std::time::Duration;

use clap::Parser;
use serde_json::json;
use uuid::Uuid;

use fleet_dispatch::api::DispatchClient;
use fleet_dispatch::scheduler::SubmitRequest;

#[derive(Parser, Debug)]
#[command(name = "submit-job")]
#[command(about = "Submit a job to a fleet-dispatch server and wait for it")]
struct Args {
    /// Server address
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    addr: String,

    #[arg(long, default_value = "demo")]
    tenant: String,

    #[arg(long)]
    workflow: String,

    /// Shell command for the worker to run
    #[arg(short, long)]
    command: String,

    #[arg(long, default_value = "5")]
    priority: i32,

    /// Give up polling after this many seconds
    #[arg(long, default_value = "120")]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let client = DispatchClient::new(&args.addr);

    let req = SubmitRequest::new(
        &args.tenant,
        &args.workflow,
        Uuid::new_v4().to_string(),
        json!({ "command": args.command }),
    )
    .with_priority(args.priority);

    let job = client.submit(&req).await?.into_job();
    println!("Submitted job {} ({})", job.id, job.status);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.timeout_secs);
    loop {
        let job = client.job(&job.id).await?;
        if job.status.is_terminal() {
            println!("Job {} finished: {}", job.id, job.status);
            if let Some(result) = job.result {
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            if let Some(error) = job.error_message {
                println!("Error: {}", error);
            }
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            println!("Job {} still {} after {}s", job.id, job.status, args.timeout_secs);
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

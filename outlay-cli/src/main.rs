use clap::{Parser, Subcommand};
use outlay_common::{IpcClient, IpcCommand, IpcResponse};

#[derive(Parser)]
#[command(name = "outlayctl")]
#[command(about = "outlayctl (outlay daemon control)")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reload the configuration and apply the matching profile
    Reload,

    /// Apply the profile with this name
    Switch {
        profile: String,
    },

    /// Show the active profile and connected outputs
    Status,
}

fn main() {
    let cli = Cli::parse();

    let command = match cli.command {
        Commands::Reload => IpcCommand::Reload,
        Commands::Switch { profile } => IpcCommand::Switch { profile },
        Commands::Status => IpcCommand::Status,
    };

    match send(&command) {
        Ok(response) => {
            if !print_response(response) {
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn send(command: &IpcCommand) -> anyhow::Result<IpcResponse> {
    let client = IpcClient::new()?;
    client.send_command(command)
}

/// Returns false when the daemon reported an error
fn print_response(response: IpcResponse) -> bool {
    match response {
        IpcResponse::Success { message } => {
            println!("{}", message);
            true
        }
        IpcResponse::Error { message, .. } => {
            eprintln!("Error: {}", message);
            false
        }
        IpcResponse::Status(report) => {
            println!("Profile: {}", report.current_profile.as_deref().unwrap_or("none"));
            if let Some(pending) = &report.pending_profile {
                println!("Pending: {}", pending);
            }

            if report.heads.is_empty() {
                println!("No outputs connected");
            }
            for head in &report.heads {
                println!();
                println!("Output: {} \"{}\"", head.name, head.description);
                if head.enabled {
                    println!("  Mode: {}", head.mode.as_deref().unwrap_or("unknown"));
                    println!("  Position: {},{}", head.position.x, head.position.y);
                    println!("  Scale: {}", head.scale);
                    println!("  Transform: {}", head.transform);
                } else {
                    println!("  Disabled");
                }
            }
            true
        }
    }
}

use args::{Args, Command};
use clap::Parser;
use llm::ChatPrompt;

mod args;
mod commands;
mod logger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.config()?;

    logger::init(&args)?;

    let result = match &args.command {
        Command::Chat {
            system,
            user,
            max_tokens,
        } => {
            let prompt = ChatPrompt {
                system: system.clone(),
                user: user.clone(),
                max_tokens: *max_tokens,
            };

            commands::chat(&config, prompt).await
        }
        Command::Models { paid } => commands::models(&config, *paid).await,
        Command::Warm => commands::warm(&config).await,
        Command::Allow { bucket_key, cost } => commands::allow(&config, bucket_key, *cost).await,
    };

    if let Err(e) = result {
        log::error!("{e:#}");
        std::process::exit(1);
    }

    Ok(())
}

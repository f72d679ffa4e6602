use clap::{Args, Subcommand};

#[derive(Subcommand)]
pub enum Commands {
    /// Load the model and stream responses for one or more prompts
    Generate(GenerateCommand),
    /// Serve the bridge as JSON lines over stdin/stdout
    Serve(ServeCommand),
}

#[derive(Args, Debug, Clone)]
pub struct GenerateCommand {
    /// Prompt to send; repeat for a multi-turn conversation
    #[arg(short, long = "prompt", required = true)]
    pub prompts: Vec<String>,

    /// Reset the session between prompts
    #[arg(long, default_value_t = false)]
    pub fresh: bool,

    /// Print the request id and final response as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ServeCommand {
    /// Load the model before reading the first call
    #[arg(long, default_value_t = false)]
    pub preload: bool,
}

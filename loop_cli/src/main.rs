use clap::Parser;
use loop_core::*;
use std::io::{self, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "loop-algorithm")]
#[command(about = "Glucose forecast and insulin dose recommendation", long_about = None)]
struct Cli {
    /// Scenario fixture (JSON), or "-" for stdin
    input: PathBuf,

    /// Config file (defaults to the platform config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Effects to include in the forecast, e.g. "carbs,insulin"
    #[arg(long)]
    effects: Option<String>,

    /// Log level for stderr output (overrides config)
    #[arg(long)]
    log_level: Option<String>,

    /// Print the forecast and its effects without a dose recommendation
    #[arg(long)]
    prediction_only: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match &cli.log_level {
        Some(level) => loop_core::logging::init_with_level(level),
        None => loop_core::logging::init(&config.logging),
    }

    let mut settings = config.settings()?;
    if let Some(effects) = &cli.effects {
        settings.effects = effects.parse().map_err(Error::Config)?;
    }

    let fixture = if cli.input.as_os_str() == "-" {
        FixtureInput::from_reader(io::stdin().lock())?
    } else {
        FixtureInput::load(&cli.input)?
    };
    let input = fixture.into_input(&config)?;

    if cli.prediction_only {
        let prediction = generate_prediction(&input, &settings);
        return print_json(&serde_json::to_string_pretty(&prediction)?);
    }

    let output = run(&input, &settings);
    print_json(&FixtureOutput::from(&output).to_json_pretty()?)?;

    // forecast is printed either way; a refused recommendation still fails the process
    match output.recommendation_result {
        Ok(_) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn print_json(json: &str) -> Result<()> {
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", json)?;
    stdout.flush()?;
    Ok(())
}

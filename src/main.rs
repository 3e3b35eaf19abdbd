//! Runs an elimination tournament described by environment variables.
//!
//! See [`ai_knockout::setup`], [`ai_knockout::limits`] and [`ai_knockout::configuration`]
//! for the variables read.

use ai_knockout::prelude::*;

fn main() -> anyhow::Result<()> {
    let config = Configuration::from_env();
    let setup = ArenaSetupBuilder::from_env()?.build()?;
    let limits = LimitsBuilder::from_env()?.build()?;
    let output = setup.output_dir().to_path_buf();

    let run = Tournament::new(setup, limits, config)?.run()?;

    println!("\nFinal standings:");
    for standing in run.standings() {
        println!(
            "{:>3}. #{:<3} {} ({}){}",
            standing.place,
            standing.seed,
            standing.player,
            standing.group,
            if standing.eliminated_in.is_empty() {
                String::new()
            } else {
                format!(" - out in {}", standing.eliminated_in)
            }
        );
    }
    println!("\nResults written to '{}'", output.display());
    Ok(())
}

use anyhow::Result;
use clap::Parser;
use judgehost::monitor::{self, MonitorArgs};

fn main() -> Result<()> {
    let args = MonitorArgs::parse();
    let report = monitor::run(&args)?;
    println!("{}", report);
    Ok(())
}

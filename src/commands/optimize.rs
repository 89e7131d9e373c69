//! Optimize command implementation with progress tracking

use anyhow::Result;
use adaptive_strategy::optimizer::Optimizer;
use adaptive_strategy::Config;
use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use tracing::info;

pub fn run(
    config_path: String,
    data_override: Option<String>,
    sort_by: String,
    top: usize,
    sequential: bool,
) -> Result<()> {
    info!("Starting optimization");

    let config = Config::from_file(&config_path)?;
    if config.grid.is_none() {
        anyhow::bail!("{} has no `grid` section to optimize over", config_path);
    }
    let candles = super::load_bars(&config, data_override)?;

    let optimizer = Optimizer::new(config);
    let combinations = optimizer.combinations()?;
    let total = combinations.len();

    println!("\n{}", "=".repeat(70));
    println!("OPTIMIZATION SUMMARY");
    println!("{}", "=".repeat(70));
    println!("  Bars:          {}", candles.len());
    println!("  Combinations:  {}", total);
    println!("  Mode:          {}", if sequential { "sequential" } else { "parallel" });
    println!("{}\n", "=".repeat(70));

    let mut results = if sequential {
        optimizer.optimize_sequential(&candles, combinations)
    } else {
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{percent:>3}%|{bar:40}| {pos}/{len} [{elapsed}<{eta}, {per_sec:.2}]")?
                .progress_chars("##-"),
        );
        let results = optimizer.optimize_with_progress(&candles, combinations, &pb);
        pb.finish_and_clear();
        results
    };

    Optimizer::sort_results(&mut results, &sort_by);
    info!("Total results: {}, sorted by: {}", results.len(), sort_by);

    let display_count = top.min(results.len());
    println!("\n{}", "=".repeat(110));
    println!("TOP {} OPTIMIZATION RESULTS (sorted by {})", display_count, sort_by);
    println!("{}", "=".repeat(110));
    println!(
        "{:>4} {:>8} {:>8} {:>8} {:>9} {:>8} {:>7} {:>7}  Params",
        "#", "Sharpe", "Sortino", "Calmar", "Return%", "MaxDD%", "WinR%", "Trades"
    );
    println!("{}", "-".repeat(110));
    for (rank, r) in results.iter().take(display_count).enumerate() {
        let params = r
            .params
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .join(" ");
        println!(
            "{:>4} {:>8.2} {:>8.2} {:>8.2} {:>9.2} {:>8.2} {:>7.1} {:>7}  {}",
            rank + 1,
            r.sharpe_ratio,
            r.sortino_ratio,
            r.calmar_ratio,
            r.total_return,
            r.max_drawdown,
            r.win_rate,
            r.total_trades,
            params
        );
    }
    println!("{}", "=".repeat(110));

    info!("Optimization completed");
    Ok(())
}

//! Interface de terminal do ymcrawl: barra de progresso e resumo colorido.
//!
//! Usa `indicatif` para a barra de progresso do crawl e `console` para a
//! estilização. O [`CrawlProgress`] acompanha os itens que chegam a um estado
//! terminal e imprime o resumo ao final da execução.

use std::path::Path;

use console::Style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::engine::Summary;
use crate::engine::checkpoint::CheckpointSnapshot;

const BAR_TEMPLATE: &str = "{spinner:.cyan} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}";

/// Barra de progresso do crawl e estilos para o resumo.
pub struct CrawlProgress {
    // Barra compartilhada com o scheduler.
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl CrawlProgress {
    /// Cria a barra em stdout; os logs do tracing ficam em stderr.
    pub fn start() -> Self {
        let pb = ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::stdout());
        pb.set_style(
            ProgressStyle::with_template(BAR_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        pb.enable_steady_tick(std::time::Duration::from_millis(120));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// Handle da barra para o scheduler atualizar.
    pub fn bar(&self) -> ProgressBar {
        self.pb.clone()
    }

    /// Finaliza a barra e imprime o resumo da execução.
    pub fn finish(&self, summary: &Summary) {
        self.pb.finish_and_clear();
        print_summary(summary, &self.green, &self.red, &self.yellow, &self.dim);
    }
}

fn print_summary(summary: &Summary, green: &Style, red: &Style, yellow: &Style, dim: &Style) {
    println!();
    println!("{}", green.apply_to("─── Crawl Summary ───"));
    println!("  {} Succeeded   {}", green.apply_to("✓"), summary.succeeded);
    println!("  {} Failed      {}", red.apply_to("✗"), summary.failed);
    println!("  {} Abandoned   {}", yellow.apply_to("↻"), summary.abandoned);
    println!("  {} Pending     {}", yellow.apply_to("…"), summary.pending);
    println!("    Skipped     {}", summary.skipped);
    println!(
        "{}",
        dim.apply_to(format!(
            "    {} fetches ({} rate limited), {} records in {} batches, {} cooldowns",
            summary.fetches,
            summary.rate_limited,
            summary.records_written,
            summary.flush_batches,
            summary.cooldowns
        ))
    );
    println!(
        "{}",
        dim.apply_to(format!(
            "    window {} → {} in flight, delay {}ms → {}ms",
            summary.initial_window.concurrency,
            summary.final_window.concurrency,
            summary.initial_window.delay.as_millis(),
            summary.final_window.delay.as_millis()
        ))
    );
    println!(
        "    Stopped: {} after {:.1}s",
        summary.halt_reason,
        summary.elapsed.as_secs_f64()
    );
    if summary.failed + summary.abandoned + summary.pending > 0 {
        println!(
            "{}",
            yellow.apply_to("    Re-run to continue; --retry-abandoned re-admits failed items.")
        );
    }
}

/// Imprime o estado de um checkpoint (comando `status`).
pub fn print_status(path: &Path, snapshot: &CheckpointSnapshot) {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    let yellow = Style::new().yellow();

    let counts = snapshot.counts();
    println!("{}", green.apply_to(format!("─── {} ───", path.display())));
    println!("  {} Succeeded   {}", green.apply_to("✓"), counts.succeeded);
    println!("  {} Failed      {}", red.apply_to("✗"), counts.failed);
    println!("  {} Abandoned   {}", yellow.apply_to("↻"), counts.abandoned);
    println!("    Total       {}", counts.total());
    if snapshot.skipped_lines > 0 {
        println!(
            "  {} {} unreadable lines ignored",
            yellow.apply_to("!"),
            snapshot.skipped_lines
        );
    }
    match snapshot.last_run() {
        Some((run_id, at)) => println!("    Last run    {run_id} at {}", at.to_rfc3339()),
        None => println!("    No runs recorded yet"),
    }
}

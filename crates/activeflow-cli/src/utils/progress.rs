use activeflow::engine::progress::{Progress, ProgressCallback};
use activeflow::engine::sampling::StatusCounts;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressState, ProgressStyle};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

const SPINNER_TICK_MS: u64 = 80;

/// What a campaign has produced so far in this invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CampaignTally {
    /// Walker outcomes summed over every sampled iteration.
    pub walkers: StatusCounts,
    pub checkpoints: usize,
    pub last_checkpoint: Option<PathBuf>,
}

struct View {
    bar: ProgressBar,
    phase: &'static str,
    tally: CampaignTally,
}

/// Renders learning progress as a spinner per phase and a bar over iterations.
#[derive(Clone)]
pub struct CliProgressHandler {
    display: Arc<Mutex<View>>,
}

impl CliProgressHandler {
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    fn with_target(target: ProgressDrawTarget) -> Self {
        let bar = ProgressBar::with_draw_target(Some(0), target).with_style(spinner_style());
        bar.finish_and_clear();
        Self {
            display: Arc::new(Mutex::new(View {
                bar,
                phase: "",
                tally: CampaignTally::default(),
            })),
        }
    }

    pub fn tally(&self) -> CampaignTally {
        self.display
            .lock()
            .map(|display| display.tally.clone())
            .unwrap_or_default()
    }

    pub fn get_callback(&self) -> ProgressCallback<'static> {
        let display = self.display.clone();

        Box::new(move |progress: Progress| {
            let Ok(mut display) = display.lock() else {
                warn!("Progress display mutex was poisoned; dropping a progress event.");
                return;
            };
            display.handle(progress);
        })
    }
}

impl Default for CliProgressHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl View {
    fn handle(&mut self, progress: Progress) {
        match progress {
            Progress::PhaseStart { name } => {
                self.phase = name;
                self.bar.reset();
                self.bar.set_length(0);
                self.bar.set_prefix("");
                self.bar.set_style(spinner_style());
                self.bar.enable_steady_tick(Duration::from_millis(SPINNER_TICK_MS));
                self.bar.set_message(name);
            }
            Progress::PhaseFinish => {
                self.bar.disable_steady_tick();
                self.bar.finish_with_message(format!("✓ {}", self.phase));
            }
            Progress::TaskStart { total_steps } => {
                self.bar.disable_steady_tick();
                self.bar.reset();
                self.bar.set_length(total_steps);
                self.bar.set_position(0);
                self.bar.set_style(iteration_style());
            }
            Progress::IterationStart { index, total } => {
                self.bar.set_prefix(format!("Iteration {}/{}", index + 1, total));
                self.bar.set_message("sampling");
            }
            Progress::WalkersSampled { index, counts } => {
                self.tally.walkers += counts;
                self.bar.println(format!("  Iteration {}: {}", index + 1, counts));
                let failed = self.tally.walkers.failed + self.tally.walkers.force_exceeded;
                if failed > 0 {
                    self.bar.set_message(format!("{} walker run(s) discarded", failed));
                }
            }
            Progress::CheckpointWritten { index, dir } => {
                debug!(iteration = index, dir = %dir.display(), "Checkpoint reported");
                self.tally.checkpoints += 1;
                self.tally.last_checkpoint = Some(dir);
            }
            Progress::TaskIncrement => {
                self.bar.inc(1);
            }
            Progress::TaskFinish => {
                if let Some(length) = self.bar.length() {
                    self.bar.set_position(length);
                }
                self.bar.finish();
            }
            Progress::Message(msg) => {
                if self.bar.is_finished() {
                    self.bar.set_message(msg);
                } else {
                    self.bar.println(format!("  {}", msg));
                }
            }
        }
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.green} {msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn iteration_style() -> ProgressStyle {
    match ProgressStyle::with_template("{prefix:<16} [{bar:40.cyan/blue}] {pos}/{len} ({elapsed}) {msg}") {
        Ok(style) => style
            .with_key("elapsed", |state: &ProgressState, w: &mut dyn std::fmt::Write| {
                let _ = write!(w, "{:.0}s", state.elapsed().as_secs_f64());
            })
            .progress_chars("##-"),
        Err(_) => ProgressStyle::default_bar(),
    }
}

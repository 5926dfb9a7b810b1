use crate::cli::StatusArgs;
use crate::error::{CliError, Result};
use activeflow::core::io::{traits::GeometryFile, xyz::XyzFile};
use activeflow::engine::checkpoint::{self, TRAIN_FILE, VALID_FILE};
use activeflow::workflows::learning::SequentialLearning;
use std::path::Path;

pub fn run(args: StatusArgs) -> Result<()> {
    print!("{}", summary(&args.output)?);
    Ok(())
}

fn count_frames(path: &Path) -> Result<usize> {
    XyzFile::count_frames_in_path(path).map_err(|e| CliError::FileParsing {
        path: path.to_path_buf(),
        source: e.into(),
    })
}

fn summary(output: &Path) -> Result<String> {
    let learning = SequentialLearning::load(output)?;
    let total = learning.config().niterations;
    let Some(marker) = checkpoint::latest(output)? else {
        return Ok(format!("Completed iterations: 0/{}\n", total));
    };
    let dir = checkpoint::iteration_dir(output, marker.iteration);
    Ok(format!(
        "Completed iterations: {}/{}\n\
         Walkers: {}\n\
         Training set: {}\n\
         Validation set: {}\n\
         Next identifier: {}\n\
         Latest checkpoint: {}\n",
        marker.iteration + 1,
        total,
        marker.nwalkers,
        count_frames(&dir.join(TRAIN_FILE))?,
        count_frames(&dir.join(VALID_FILE))?,
        marker.identifier,
        dir.display()
    ))
}

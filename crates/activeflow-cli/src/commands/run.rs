use crate::cli::RunArgs;
use crate::config::{PartialRunConfig, ReferenceSetup, WalkerSetup, config_base};
use crate::error::{CliError, Result};
use crate::utils::progress::CliProgressHandler;
use activeflow::core::io::{traits::GeometryFile, xyz::XyzFile};
use activeflow::core::potentials::plumed::PlumedBias;
use activeflow::engine::context::ExecutionContext;
use activeflow::engine::dataset::Dataset;
use activeflow::engine::error::EngineError;
use activeflow::engine::hamiltonian::Hamiltonian;
use activeflow::engine::model::Model;
use activeflow::engine::progress::ProgressReporter;
use activeflow::engine::reference::{Reference, cp2k::Cp2k};
use activeflow::engine::walker::{self, Walker, WalkerBuilder};
use activeflow::workflows::learning::SequentialLearning;
use std::sync::Arc;
use tracing::info;

pub async fn run(args: RunArgs) -> Result<()> {
    let partial = PartialRunConfig::from_file(&args.config)?;
    let base = config_base(&args.config);
    info!("Merging configuration from file and CLI arguments...");
    let setup = partial.merge_with_cli(&args, &base)?;

    let ctx = ExecutionContext::new(setup.context.clone())?;
    let reference = build_reference(&setup.reference)?;
    let mut walkers = build_walkers(&ctx, &setup.walkers)?;
    info!("Prepared {} walker(s) from {:?}", walkers.len(), &setup.walkers.start);

    let mut model = Model::new(&ctx, &setup.model.name, setup.model.config.clone())
        .with_executor(&setup.model.executor);
    let initial_data = setup
        .initial_data
        .as_ref()
        .map(|path| Dataset::load(&ctx, path))
        .transpose()?;

    let learning = SequentialLearning::new(&setup.output, setup.learning.clone())?;

    let progress_handler = CliProgressHandler::new();
    let reporter = ProgressReporter::with_callback(progress_handler.get_callback());

    println!("Starting sequential learning in {}...", setup.output.display());
    info!("Invoking the core learning workflow...");
    let outcome = learning
        .run(
            &ctx,
            &mut model,
            &reference,
            &mut walkers,
            initial_data.as_ref(),
            &reporter,
        )
        .await?;

    let labeled = outcome.data.length().resolve().await?;
    let ntrain = outcome.train.length().resolve().await?;
    let nvalid = outcome.valid.length().resolve().await?;
    info!(labeled, ntrain, nvalid, "Workflow finished");
    if labeled == 0 {
        println!("Nothing to do: all iterations were already completed.");
    } else {
        println!(
            "✓ Labeled {} geometries. Training set: {}, validation set: {}.",
            labeled, ntrain, nvalid
        );
    }
    let tally = progress_handler.tally();
    if tally.walkers.total() > 0 {
        info!(walkers = %tally.walkers, checkpoints = tally.checkpoints, "Walker outcomes");
        println!("Walker runs: {}.", tally.walkers);
    }
    match &tally.last_checkpoint {
        Some(dir) => println!("Latest checkpoint: {}", dir.display()),
        None => println!("Checkpoints written to: {}", setup.output.display()),
    }
    Ok(())
}

fn build_reference(setup: &ReferenceSetup) -> Result<Reference> {
    let input = std::fs::read_to_string(&setup.cp2k_input)?;
    let backend = Cp2k::new(&input)?;
    Ok(Reference::new(
        Arc::new(backend),
        setup.properties.clone(),
        &setup.executor,
    )?)
}

/// One walker per start geometry, cycled to `count` when given.
fn build_walkers(ctx: &ExecutionContext, setup: &WalkerSetup) -> Result<Vec<Walker>> {
    let starts = XyzFile::read_from_path(&setup.start).map_err(|e| CliError::FileParsing {
        path: setup.start.clone(),
        source: e.into(),
    })?;
    if starts.is_empty() {
        return Err(CliError::Config(format!(
            "No start geometries found in {:?}",
            &setup.start
        )));
    }
    let count = setup.count.unwrap_or(starts.len());
    if count == 0 {
        return Err(CliError::Config("`walkers.count` must be positive.".to_string()));
    }

    let bias = match &setup.plumed {
        Some(path) => {
            let input = std::fs::read_to_string(path)?;
            Hamiltonian::PlumedBias(PlumedBias::new(&input).map_err(EngineError::from)?)
        }
        None => Hamiltonian::zero(),
    };

    let mut walkers = starts
        .iter()
        .cycle()
        .take(count)
        .map(|start| {
            let mut builder = WalkerBuilder::new()
                .start(start.clone())
                .hamiltonian(bias.clone())
                .temperature(setup.temperature);
            if let Some(pressure) = setup.pressure {
                builder = builder.pressure(pressure);
            }
            if let Some(timestep) = setup.timestep {
                builder = builder.timestep(timestep);
            }
            if let Some(nbeads) = setup.nbeads {
                builder = builder.nbeads(nbeads);
            }
            builder.build()
        })
        .collect::<std::result::Result<Vec<_>, EngineError>>()?;

    if let Some((trial_frequency, rescale_kinetic)) = setup.replica_exchange {
        walker::replica_exchange(ctx, &mut walkers, trial_frequency, rescale_kinetic)?;
    }
    Ok(walkers)
}

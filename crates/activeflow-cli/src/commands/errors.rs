use crate::cli::ErrorsArgs;
use crate::error::{CliError, Result};
use activeflow::core::io::{traits::GeometryFile, xyz::XyzFile};
use activeflow::core::metrics::{self, ErrorQuery, Metric, Property};
use activeflow::core::models::geometry::Geometry;
use activeflow::engine::error::EngineError;
use std::fmt::Write;
use std::path::Path;
use tracing::info;

pub fn run(args: ErrorsArgs) -> Result<()> {
    print!("{}", error_table(&args)?);
    Ok(())
}

fn read(path: &Path) -> Result<Vec<Geometry>> {
    XyzFile::read_from_path(path).map_err(|e| CliError::FileParsing {
        path: path.to_path_buf(),
        source: e.into(),
    })
}

fn query(args: &ErrorsArgs) -> Result<ErrorQuery> {
    let metric: Metric = args
        .metric
        .parse()
        .map_err(|e| CliError::Argument(format!("{}", e)))?;
    let properties = args
        .properties
        .iter()
        .map(|p| p.parse::<Property>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| CliError::Argument(format!("{}", e)))?;
    let query = ErrorQuery::new(metric, properties);
    Ok(match &args.elements {
        Some(elements) => query.with_elements(elements.clone()),
        None => query,
    })
}

/// One row per compared structure followed by the column means.
fn error_table(args: &ErrorsArgs) -> Result<String> {
    let query = query(args)?;
    let reference = read(&args.reference)?;
    let predicted = args.predicted.as_deref().map(read).transpose()?;
    let errors = metrics::compute_errors(&reference, predicted.as_deref(), &query)
        .map_err(EngineError::from)?;
    info!(rows = errors.nrows(), metric = ?query.metric, "Computed errors");

    let mut out = String::new();
    let _ = write!(out, "{:>6}", "#");
    for property in &query.properties {
        let _ = write!(out, " {:>24}", format!("{} [{}]", property, property.unit()));
    }
    out.push('\n');
    for (i, row) in errors.row_iter().enumerate() {
        let _ = write!(out, "{:>6}", i);
        for value in row.iter() {
            let _ = write!(out, " {:>24.3}", value);
        }
        out.push('\n');
    }
    let _ = write!(out, "{:>6}", "mean");
    for column in errors.column_iter() {
        let _ = write!(out, " {:>24.3}", column.mean());
    }
    out.push('\n');
    Ok(out)
}

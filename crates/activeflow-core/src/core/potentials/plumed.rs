use super::{Evaluation, Potential, PotentialError};
use crate::core::models::geometry::Geometry;
use nalgebra::{Matrix3, Vector3};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// kJ/mol expressed in eV.
pub const KJMOL_TO_EV: f64 = 0.010_364_269;
/// kcal/mol expressed in eV.
pub const KCALMOL_TO_EV: f64 = 0.043_364_104;

const BIAS_KEYWORDS: [&str; 5] = ["RESTRAINT", "UPPER_WALLS", "LOWER_WALLS", "METAD", "EXTERNAL"];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlumedError {
    #[error("Line {line}: PRINT actions are not allowed in bias input")]
    PrintNotAllowed { line: usize },
    #[error("Duplicate action label '{0}'")]
    DuplicateLabel(String),
    #[error("Bias keyword '{0}' appears more than once")]
    DuplicateBias(String),
    #[error("Line {line}: argument '{arg}' does not refer to a defined collective variable")]
    UnknownArgument { arg: String, line: usize },
    #[error("Line {line}: {action} requires keyword {keyword}")]
    MissingKeyword {
        action: String,
        keyword: &'static str,
        line: usize,
    },
    #[error("Line {line}: invalid value '{value}' for {keyword}")]
    InvalidValue {
        keyword: String,
        value: String,
        line: usize,
    },
    #[error("Line {line}: bias {action} must act on a single collective variable")]
    MultiDimensionalBias { action: String, line: usize },
    #[error("Input does not define any bias")]
    NoBias,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Units {
    /// Å per PLUMED length unit.
    length: f64,
    /// eV per PLUMED energy unit.
    energy: f64,
}

impl Default for Units {
    fn default() -> Self {
        Self {
            length: 10.0,
            energy: KJMOL_TO_EV,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum CollectiveVariable {
    Distance { i: usize, j: usize, pbc: bool },
    Volume,
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BiasKind {
    Restraint { slope: f64 },
    UpperWall { exponent: f64, epsilon: f64, offset: f64 },
    LowerWall { exponent: f64, epsilon: f64, offset: f64 },
}

#[derive(Debug, Clone, PartialEq)]
enum Bias {
    Analytic {
        kind: BiasKind,
        arg: String,
        at: f64,
        kappa: f64,
    },
    Other(String),
}

struct Action<'a> {
    line: usize,
    label: Option<String>,
    keyword: &'a str,
    options: BTreeMap<String, String>,
    flags: HashSet<&'a str>,
}

impl<'a> Action<'a> {
    fn parse(line: usize, text: &'a str) -> Option<Self> {
        let mut tokens = text.split_whitespace().peekable();
        let mut label = None;
        let first = tokens.next()?;
        let keyword = match first.strip_suffix(':') {
            Some(l) => {
                label = Some(l.to_string());
                tokens.next()?
            }
            None => first,
        };
        let mut options = BTreeMap::new();
        let mut flags = HashSet::new();
        for token in tokens {
            match token.split_once('=') {
                Some(("LABEL", value)) => label = Some(value.to_string()),
                Some((key, value)) => {
                    options.insert(key.to_string(), value.to_string());
                }
                None => {
                    flags.insert(token);
                }
            }
        }
        Some(Self {
            line,
            label,
            keyword,
            options,
            flags,
        })
    }

    fn required(&self, keyword: &'static str) -> Result<&str, PlumedError> {
        self.options
            .get(keyword)
            .map(String::as_str)
            .ok_or_else(|| PlumedError::MissingKeyword {
                action: self.keyword.to_string(),
                keyword,
                line: self.line,
            })
    }

    fn float(&self, keyword: &'static str, default: Option<f64>) -> Result<f64, PlumedError> {
        match (self.options.get(keyword), default) {
            (None, Some(d)) => Ok(d),
            (None, None) => Err(PlumedError::MissingKeyword {
                action: self.keyword.to_string(),
                keyword,
                line: self.line,
            }),
            (Some(v), _) => v.parse().map_err(|_| PlumedError::InvalidValue {
                keyword: keyword.to_string(),
                value: v.clone(),
                line: self.line,
            }),
        }
    }
}

/// A PLUMED bias input, validated at construction.
///
/// The raw input is kept verbatim so it can be handed to an external sampler.
/// A subset of actions can also be evaluated in-process.
#[derive(Debug, Clone)]
pub struct PlumedBias {
    input: String,
    units: Units,
    variables: BTreeMap<String, CollectiveVariable>,
    biases: Vec<Bias>,
}

impl PlumedBias {
    pub fn new(input: &str) -> Result<Self, PlumedError> {
        let mut units = Units::default();
        let mut variables = BTreeMap::new();
        let mut biases = Vec::new();
        let mut labels = HashSet::new();
        let mut bias_keywords = HashSet::new();

        for (index, raw) in input.lines().enumerate() {
            let line = index + 1;
            let text = raw.split('#').next().unwrap_or("").trim();
            let Some(action) = Action::parse(line, text) else {
                continue;
            };
            if let Some(label) = &action.label {
                if !labels.insert(label.clone()) {
                    return Err(PlumedError::DuplicateLabel(label.clone()));
                }
            }
            match action.keyword {
                "PRINT" => return Err(PlumedError::PrintNotAllowed { line }),
                "UNITS" => units = parse_units(&action, units)?,
                "RESTART" | "FLUSH" => {}
                keyword if BIAS_KEYWORDS.contains(&keyword) => {
                    if !bias_keywords.insert(keyword.to_string()) {
                        return Err(PlumedError::DuplicateBias(keyword.to_string()));
                    }
                    biases.push(parse_bias(&action, &variables)?);
                }
                _ => {
                    if let Some(label) = &action.label {
                        variables.insert(label.clone(), parse_variable(&action)?);
                    }
                }
            }
        }

        if biases.is_empty() {
            return Err(PlumedError::NoBias);
        }
        Ok(Self {
            input: input.to_string(),
            units,
            variables,
            biases,
        })
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    /// Names of the bias actions in input order.
    pub fn bias_keywords(&self) -> Vec<&str> {
        self.biases
            .iter()
            .map(|b| match b {
                Bias::Analytic { kind, .. } => match kind {
                    BiasKind::Restraint { .. } => "RESTRAINT",
                    BiasKind::UpperWall { .. } => "UPPER_WALLS",
                    BiasKind::LowerWall { .. } => "LOWER_WALLS",
                },
                Bias::Other(keyword) => keyword.as_str(),
            })
            .collect()
    }

    fn normalized(&self) -> Vec<&str> {
        self.input
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect()
    }

    /// Value of a collective variable in Å (or Å³) and its gradient contributions.
    fn evaluate_variable(
        &self,
        name: &str,
        geometry: &Geometry,
    ) -> Result<(f64, VariableGradient), PotentialError> {
        match self.variables.get(name) {
            Some(CollectiveVariable::Distance { i, j, pbc }) => {
                let natoms = geometry.natoms();
                for &index in [i, j] {
                    if index >= natoms {
                        return Err(PotentialError::AtomOutOfRange { index, natoms });
                    }
                }
                let atoms = geometry.atoms();
                let mut delta = atoms[*j].position - atoms[*i].position;
                if *pbc && geometry.periodic() {
                    delta = minimum_image(delta, geometry.cell());
                }
                let distance = delta.norm();
                Ok((distance, VariableGradient::Pair(*i, *j, delta / distance)))
            }
            Some(CollectiveVariable::Volume) => {
                if !geometry.periodic() {
                    return Err(PotentialError::RequiresPeriodic(name.to_string()));
                }
                Ok((geometry.volume(), VariableGradient::Volume))
            }
            Some(CollectiveVariable::Other(keyword)) => {
                Err(PotentialError::Unsupported(keyword.clone()))
            }
            None => Err(PotentialError::Unsupported(name.to_string())),
        }
    }
}

impl PartialEq for PlumedBias {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

enum VariableGradient {
    /// Unit vector from atom i to atom j.
    Pair(usize, usize, Vector3<f64>),
    Volume,
}

fn minimum_image(delta: Vector3<f64>, cell: &Matrix3<f64>) -> Vector3<f64> {
    let lattice = cell.transpose();
    match lattice.try_inverse() {
        Some(inverse) => {
            let fractional = inverse * delta;
            lattice * fractional.map(|f| f - f.round())
        }
        None => delta,
    }
}

fn parse_units(action: &Action, mut units: Units) -> Result<Units, PlumedError> {
    if let Some(length) = action.options.get("LENGTH") {
        units.length = match length.to_ascii_lowercase().as_str() {
            "a" | "ang" | "angstrom" => 1.0,
            "nm" => 10.0,
            "bohr" => 0.529_177_210_9,
            _ => {
                return Err(PlumedError::InvalidValue {
                    keyword: "LENGTH".into(),
                    value: length.clone(),
                    line: action.line,
                });
            }
        };
    }
    if let Some(energy) = action.options.get("ENERGY") {
        units.energy = match energy.to_ascii_lowercase().as_str() {
            "kj/mol" => KJMOL_TO_EV,
            "kcal/mol" => KCALMOL_TO_EV,
            "ev" => 1.0,
            _ => {
                return Err(PlumedError::InvalidValue {
                    keyword: "ENERGY".into(),
                    value: energy.clone(),
                    line: action.line,
                });
            }
        };
    }
    Ok(units)
}

fn parse_variable(action: &Action) -> Result<CollectiveVariable, PlumedError> {
    match action.keyword {
        "DISTANCE" => {
            let atoms = action.required("ATOMS")?;
            let indices: Vec<usize> = atoms
                .split(',')
                .map(|a| a.trim().parse::<usize>())
                .collect::<Result<_, _>>()
                .ok()
                .filter(|v: &Vec<usize>| v.len() == 2 && v.iter().all(|&i| i >= 1))
                .ok_or_else(|| PlumedError::InvalidValue {
                    keyword: "ATOMS".into(),
                    value: atoms.to_string(),
                    line: action.line,
                })?;
            Ok(CollectiveVariable::Distance {
                i: indices[0] - 1,
                j: indices[1] - 1,
                pbc: !action.flags.contains("NOPBC"),
            })
        }
        "VOLUME" => Ok(CollectiveVariable::Volume),
        other => Ok(CollectiveVariable::Other(other.to_string())),
    }
}

fn parse_bias(
    action: &Action,
    variables: &BTreeMap<String, CollectiveVariable>,
) -> Result<Bias, PlumedError> {
    let arg = action.required("ARG")?;
    if arg.contains(',') {
        return Err(PlumedError::MultiDimensionalBias {
            action: action.keyword.to_string(),
            line: action.line,
        });
    }
    let cv = arg.split('.').next().unwrap_or(arg);
    if !variables.contains_key(cv) {
        return Err(PlumedError::UnknownArgument {
            arg: arg.to_string(),
            line: action.line,
        });
    }
    let wall = |action: &Action| -> Result<(f64, f64, f64), PlumedError> {
        Ok((
            action.float("EXP", Some(2.0))?,
            action.float("EPS", Some(1.0))?,
            action.float("OFFSET", Some(0.0))?,
        ))
    };
    let kind = match action.keyword {
        "RESTRAINT" => BiasKind::Restraint {
            slope: action.float("SLOPE", Some(0.0))?,
        },
        "UPPER_WALLS" => {
            let (exponent, epsilon, offset) = wall(action)?;
            BiasKind::UpperWall {
                exponent,
                epsilon,
                offset,
            }
        }
        "LOWER_WALLS" => {
            let (exponent, epsilon, offset) = wall(action)?;
            BiasKind::LowerWall {
                exponent,
                epsilon,
                offset,
            }
        }
        other => return Ok(Bias::Other(other.to_string())),
    };
    Ok(Bias::Analytic {
        kind,
        arg: cv.to_string(),
        at: action.float("AT", None)?,
        kappa: action.float("KAPPA", None)?,
    })
}

/// Bias energy and its derivative with respect to the collective variable,
/// both in PLUMED units.
fn bias_energy(kind: BiasKind, s: f64, at: f64, kappa: f64) -> (f64, f64) {
    match kind {
        BiasKind::Restraint { slope } => {
            let d = s - at;
            (0.5 * kappa * d * d + slope * d, kappa * d + slope)
        }
        BiasKind::UpperWall {
            exponent,
            epsilon,
            offset,
        } => {
            let u = (s - at + offset) / epsilon;
            if u > 0.0 {
                (
                    kappa * u.powf(exponent),
                    kappa * exponent * u.powf(exponent - 1.0) / epsilon,
                )
            } else {
                (0.0, 0.0)
            }
        }
        BiasKind::LowerWall {
            exponent,
            epsilon,
            offset,
        } => {
            let u = (s - at - offset) / epsilon;
            if u < 0.0 {
                let m = -u;
                (
                    kappa * m.powf(exponent),
                    -kappa * exponent * m.powf(exponent - 1.0) / epsilon,
                )
            } else {
                (0.0, 0.0)
            }
        }
    }
}

impl Potential for PlumedBias {
    fn compute(&self, geometry: &Geometry) -> Result<Evaluation, PotentialError> {
        let mut eval = Evaluation::zero(geometry.natoms(), geometry.periodic());
        for bias in &self.biases {
            let (kind, arg, at, kappa) = match bias {
                Bias::Analytic {
                    kind,
                    arg,
                    at,
                    kappa,
                } => (kind, arg, at, kappa),
                Bias::Other(keyword) => {
                    return Err(PotentialError::Unsupported(keyword.clone()));
                }
            };
            let (value, gradient) = self.evaluate_variable(arg, geometry)?;
            let dimension = match gradient {
                VariableGradient::Pair(..) => 1,
                VariableGradient::Volume => 3,
            };
            let scale = self.units.length.powi(dimension);
            let (energy, derivative) = bias_energy(*kind, value / scale, *at, *kappa);
            eval.energy += energy * self.units.energy;
            let d_energy = derivative * self.units.energy / scale;
            match gradient {
                VariableGradient::Pair(i, j, unit) => {
                    eval.forces[i] += d_energy * unit;
                    eval.forces[j] -= d_energy * unit;
                }
                VariableGradient::Volume => {
                    let stress = eval.stress.get_or_insert_with(Matrix3::zeros);
                    *stress += Matrix3::identity() * d_energy;
                }
            }
        }
        Ok(eval)
    }
}

use super::traits::GeometryFile;
use crate::core::models::element;
use crate::core::models::geometry::{Atom, Geometry};
use nalgebra::{Matrix3, Vector3};
use std::fmt::Write as _;
use std::io::{self, BufRead, Write};
use thiserror::Error;

const ORDER_PREFIX: &str = "order_";

#[derive(Debug, Error)]
pub enum XyzError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Parse error on line {line}: {kind}")]
    Parse {
        line: usize,
        kind: XyzParseErrorKind,
    },
    #[error("Input contains no frames")]
    Empty,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum XyzParseErrorKind {
    #[error("Invalid atom count '{0}'")]
    InvalidAtomCount(String),
    #[error("Unexpected end of input: expected {expected}")]
    UnexpectedEof { expected: &'static str },
    #[error("Invalid float for '{field}' (value: '{value}')")]
    InvalidFloat { field: String, value: String },
    #[error("Invalid integer for '{field}' (value: '{value}')")]
    InvalidInteger { field: String, value: String },
    #[error("Field '{field}' expects {expected} values, found {found}")]
    WrongLength {
        field: String,
        expected: usize,
        found: usize,
    },
    #[error("Unknown chemical symbol '{0}'")]
    UnknownElement(String),
    #[error("Unterminated quoted value in comment line")]
    UnterminatedQuote,
    #[error("Invalid Properties specification '{0}'")]
    InvalidProperties(String),
    #[error("Atom record has {found} columns, expected at least {expected}")]
    MissingColumns { expected: usize, found: usize },
}

/// Column layout of atom records, derived from the `Properties` key.
#[derive(Debug, Clone, PartialEq)]
struct Columns {
    species: usize,
    positions: usize,
    forces: Option<usize>,
}

impl Default for Columns {
    fn default() -> Self {
        Self {
            species: 0,
            positions: 1,
            forces: None,
        }
    }
}

impl Columns {
    fn parse(spec: &str) -> Result<Self, XyzParseErrorKind> {
        let fields: Vec<&str> = spec.split(':').collect();
        if fields.len() % 3 != 0 {
            return Err(XyzParseErrorKind::InvalidProperties(spec.to_string()));
        }
        let mut species = None;
        let mut positions = None;
        let mut forces = None;
        let mut offset = 0;
        for chunk in fields.chunks(3) {
            let ncols: usize = chunk[2]
                .parse()
                .map_err(|_| XyzParseErrorKind::InvalidProperties(spec.to_string()))?;
            match (chunk[0], ncols) {
                ("species", 1) => species = Some(offset),
                ("pos", 3) => positions = Some(offset),
                ("forces", 3) => forces = Some(offset),
                _ => {}
            }
            offset += ncols;
        }
        match (species, positions) {
            (Some(species), Some(positions)) => Ok(Self {
                species,
                positions,
                forces,
            }),
            _ => Err(XyzParseErrorKind::InvalidProperties(spec.to_string())),
        }
    }
}

#[derive(Debug, Default)]
struct Header {
    lattice: Option<Matrix3<f64>>,
    periodic: Option<bool>,
    columns: Columns,
    energy: Option<f64>,
    stress: Option<Matrix3<f64>>,
    delta: Option<f64>,
    phase: Option<String>,
    logprob: Option<Vec<f64>>,
    formation_energy: Option<f64>,
    stdout: Option<String>,
    identifier: Option<u64>,
    order: Vec<(String, f64)>,
    null: bool,
}

impl Header {
    fn parse(comment: &str) -> Result<Self, XyzParseErrorKind> {
        let mut header = Header::default();
        for (key, value) in tokenize(comment)? {
            match key.as_str() {
                "Lattice" => header.lattice = Some(parse_matrix(&key, &value)?),
                "pbc" => header.periodic = Some(value.split_whitespace().any(is_true)),
                "Properties" => header.columns = Columns::parse(&value)?,
                "energy" => header.energy = Some(parse_float(&key, &value)?),
                "stress" => header.stress = Some(parse_matrix(&key, &value)?),
                "delta" => header.delta = Some(parse_float(&key, &value)?),
                "phase" => header.phase = Some(value),
                "logprob" => header.logprob = Some(parse_floats(&key, &value)?),
                "formation_energy" => header.formation_energy = Some(parse_float(&key, &value)?),
                "stdout" => header.stdout = Some(value),
                "identifier" => {
                    header.identifier = Some(value.parse().map_err(|_| {
                        XyzParseErrorKind::InvalidInteger {
                            field: key.clone(),
                            value: value.clone(),
                        }
                    })?)
                }
                "null" => header.null = is_true(&value),
                _ => {
                    if let Some(name) = key.strip_prefix(ORDER_PREFIX) {
                        header.order.push((name.to_string(), parse_float(&key, &value)?));
                    }
                }
            }
        }
        Ok(header)
    }

    fn into_geometry(self, atoms: Vec<Atom>) -> Geometry {
        let cell = match (self.lattice, self.periodic) {
            (Some(lattice), Some(true) | None) => lattice,
            _ => Matrix3::zeros(),
        };
        let mut geometry = Geometry::from_atoms(atoms, cell);
        geometry.energy = self.energy;
        geometry.stress = self.stress;
        geometry.delta = self.delta;
        geometry.phase = self.phase;
        geometry.logprob = self.logprob;
        geometry.formation_energy = self.formation_energy;
        geometry.stdout = self.stdout;
        geometry.identifier = self.identifier;
        geometry.order = self.order.into_iter().collect();
        if self.null {
            geometry.mark_null();
        }
        geometry
    }
}

fn is_true(value: &str) -> bool {
    matches!(value, "T" | "True" | "true")
}

fn parse_float(field: &str, value: &str) -> Result<f64, XyzParseErrorKind> {
    value
        .trim()
        .parse()
        .map_err(|_| XyzParseErrorKind::InvalidFloat {
            field: field.to_string(),
            value: value.to_string(),
        })
}

fn parse_floats(field: &str, value: &str) -> Result<Vec<f64>, XyzParseErrorKind> {
    value
        .split_whitespace()
        .map(|v| parse_float(field, v))
        .collect()
}

fn parse_matrix(field: &str, value: &str) -> Result<Matrix3<f64>, XyzParseErrorKind> {
    let values = parse_floats(field, value)?;
    if values.len() != 9 {
        return Err(XyzParseErrorKind::WrongLength {
            field: field.to_string(),
            expected: 9,
            found: values.len(),
        });
    }
    Ok(Matrix3::from_row_slice(&values))
}

/// Splits an extended-XYZ comment line into `key=value` pairs.
///
/// Values may be double-quoted; inside quotes `\"` and `\\` are unescaped.
/// A bare key without `=` is read as the flag value `T`.
fn tokenize(comment: &str) -> Result<Vec<(String, String)>, XyzParseErrorKind> {
    let mut pairs = Vec::new();
    let mut chars = comment.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            break;
        }
        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| !c.is_whitespace() && *c != '=') {
            key.push(c);
        }
        if chars.next_if_eq(&'=').is_none() {
            pairs.push((key, "T".to_string()));
            continue;
        }
        let mut value = String::new();
        if chars.next_if_eq(&'"').is_some() {
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    _ => value.push(c),
                }
            }
            if !closed {
                return Err(XyzParseErrorKind::UnterminatedQuote);
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                value.push(c);
            }
        }
        pairs.push((key, value));
    }
    Ok(pairs)
}

fn parse_atom(line: &str, columns: &Columns) -> Result<Atom, XyzParseErrorKind> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let required = columns
        .forces
        .map_or(columns.positions + 3, |f| (f + 3).max(columns.positions + 3))
        .max(columns.species + 1);
    if fields.len() < required {
        return Err(XyzParseErrorKind::MissingColumns {
            expected: required,
            found: fields.len(),
        });
    }
    let symbol = fields[columns.species];
    let number = element::atomic_number(symbol)
        .ok_or_else(|| XyzParseErrorKind::UnknownElement(symbol.to_string()))?;
    let vector = |offset: usize, field: &str| -> Result<Vector3<f64>, XyzParseErrorKind> {
        Ok(Vector3::new(
            parse_float(field, fields[offset])?,
            parse_float(field, fields[offset + 1])?,
            parse_float(field, fields[offset + 2])?,
        ))
    };
    let mut atom = Atom::new(number, vector(columns.positions, "pos")?);
    if let Some(offset) = columns.forces {
        atom.force = vector(offset, "forces")?;
    }
    Ok(atom)
}

type NumberedLines<'a, R> = std::iter::Enumerate<io::Lines<&'a mut R>>;

fn next_required<R: BufRead>(
    lines: &mut NumberedLines<'_, R>,
    expected: &'static str,
    last_line: usize,
) -> Result<(usize, String), XyzError> {
    match lines.next() {
        Some((n, line)) => Ok((n + 1, line?)),
        None => Err(XyzError::Parse {
            line: last_line + 1,
            kind: XyzParseErrorKind::UnexpectedEof { expected },
        }),
    }
}

/// Reads the atom count line of the next frame, skipping blank separator lines.
fn next_count<R: BufRead>(lines: &mut NumberedLines<'_, R>) -> Result<Option<(usize, usize)>, XyzError> {
    for (n, line) in lines.by_ref() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let natoms = trimmed.parse().map_err(|_| XyzError::Parse {
            line: n + 1,
            kind: XyzParseErrorKind::InvalidAtomCount(trimmed.to_string()),
        })?;
        return Ok(Some((n + 1, natoms)));
    }
    Ok(None)
}

fn next_frame<R: BufRead>(lines: &mut NumberedLines<'_, R>) -> Result<Option<Geometry>, XyzError> {
    let Some((count_line, natoms)) = next_count(lines)? else {
        return Ok(None);
    };
    let (comment_line, comment) = next_required(lines, "comment line", count_line)?;
    let header = Header::parse(&comment).map_err(|kind| XyzError::Parse {
        line: comment_line,
        kind,
    })?;

    let mut atoms = Vec::with_capacity(natoms);
    let mut last_line = comment_line;
    for _ in 0..natoms {
        let (n, line) = next_required(lines, "atom record", last_line)?;
        let atom = parse_atom(&line, &header.columns).map_err(|kind| XyzError::Parse { line: n, kind })?;
        atoms.push(atom);
        last_line = n;
    }
    Ok(Some(header.into_geometry(atoms)))
}

fn skip_frame<R: BufRead>(lines: &mut NumberedLines<'_, R>) -> Result<bool, XyzError> {
    let Some((count_line, natoms)) = next_count(lines)? else {
        return Ok(false);
    };
    let mut last_line = count_line;
    for _ in 0..natoms + 1 {
        let (n, _) = next_required(lines, "frame record", last_line)?;
        last_line = n;
    }
    Ok(true)
}

fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

fn join_floats<'a>(values: impl IntoIterator<Item = &'a f64>) -> String {
    values
        .into_iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn comment_line(geometry: &Geometry) -> String {
    let mut comment = String::new();
    if geometry.periodic() {
        let rows: Vec<f64> = geometry.cell().transpose().iter().copied().collect();
        let _ = write!(comment, "Lattice={} pbc=\"T T T\" ", quote(&join_floats(&rows)));
    } else {
        comment.push_str("pbc=\"F F F\" ");
    }
    comment.push_str("Properties=species:S:1:pos:R:3");
    if geometry.has_forces() {
        comment.push_str(":forces:R:3");
    }

    if let Some(energy) = geometry.energy {
        let _ = write!(comment, " energy={energy}");
    }
    if let Some(stress) = &geometry.stress {
        let rows: Vec<f64> = stress.transpose().iter().copied().collect();
        let _ = write!(comment, " stress={}", quote(&join_floats(&rows)));
    }
    if let Some(delta) = geometry.delta {
        let _ = write!(comment, " delta={delta}");
    }
    if let Some(phase) = &geometry.phase {
        let _ = write!(comment, " phase={}", quote(phase));
    }
    if let Some(logprob) = &geometry.logprob {
        let _ = write!(comment, " logprob={}", quote(&join_floats(logprob)));
    }
    if let Some(formation_energy) = geometry.formation_energy {
        let _ = write!(comment, " formation_energy={formation_energy}");
    }
    if let Some(stdout) = &geometry.stdout {
        let _ = write!(comment, " stdout={}", quote(stdout));
    }
    if let Some(identifier) = geometry.identifier {
        let _ = write!(comment, " identifier={identifier}");
    }
    for (key, value) in &geometry.order {
        let _ = write!(comment, " {ORDER_PREFIX}{key}={value}");
    }
    if geometry.is_null() {
        comment.push_str(" null=T");
    }
    comment
}

fn write_frame(geometry: &Geometry, writer: &mut impl Write) -> io::Result<()> {
    writeln!(writer, "{}", geometry.natoms())?;
    writeln!(writer, "{}", comment_line(geometry))?;
    let write_forces = geometry.has_forces();
    for atom in geometry.atoms() {
        let symbol = element::symbol(atom.number).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("atomic number {} has no chemical symbol", atom.number),
            )
        })?;
        let p = &atom.position;
        write!(writer, "{symbol:<2} {:>24} {:>24} {:>24}", p.x, p.y, p.z)?;
        if write_forces {
            let f = &atom.force;
            write!(writer, " {:>24} {:>24} {:>24}", f.x, f.y, f.z)?;
        }
        writeln!(writer)?;
    }
    Ok(())
}

/// Extended XYZ reader/writer for multi-frame trajectories and datasets.
pub struct XyzFile;

impl GeometryFile for XyzFile {
    type Error = XyzError;

    fn read_from(reader: &mut impl BufRead) -> Result<Vec<Geometry>, Self::Error> {
        let mut lines = reader.lines().enumerate();
        let mut frames = Vec::new();
        while let Some(geometry) = next_frame(&mut lines)? {
            frames.push(geometry);
        }
        Ok(frames)
    }

    fn read_frame(reader: &mut impl BufRead, index: usize) -> Result<Option<Geometry>, Self::Error> {
        let mut lines = reader.lines().enumerate();
        for _ in 0..index {
            if !skip_frame(&mut lines)? {
                return Ok(None);
            }
        }
        next_frame(&mut lines)
    }

    fn count_frames(reader: &mut impl BufRead) -> Result<usize, Self::Error> {
        let mut lines = reader.lines().enumerate();
        let mut count = 0;
        while skip_frame(&mut lines)? {
            count += 1;
        }
        Ok(count)
    }

    fn write_to(geometries: &[Geometry], writer: &mut impl Write) -> Result<(), Self::Error> {
        for geometry in geometries {
            write_frame(geometry, writer)?;
        }
        Ok(())
    }
}

/// Serializes a single geometry as one extended-XYZ frame (without trailing newline).
pub fn to_string(geometry: &Geometry) -> Result<String, XyzError> {
    let mut buffer = Vec::new();
    write_frame(geometry, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).trim_end().to_string())
}

/// Parses the first frame of an extended-XYZ string.
pub fn from_str(content: &str) -> Result<Geometry, XyzError> {
    let mut reader = io::Cursor::new(content.as_bytes());
    XyzFile::read_frame(&mut reader, 0)?.ok_or(XyzError::Empty)
}

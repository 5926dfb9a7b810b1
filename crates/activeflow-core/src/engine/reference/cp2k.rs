use super::ReferenceBackend;
use crate::core::metrics::Property;
use crate::core::models::element;
use crate::core::models::geometry::Geometry;
use crate::engine::error::EngineError;
use crate::engine::process::InputFile;
use nalgebra::Vector3;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

/// eV per Hartree.
pub const HARTREE: f64 = 27.211_386_024_367_243;
/// Å per Bohr.
pub const BOHR: f64 = 0.529_177_210_563_841_1;

pub const INPUT_FILE: &str = "cp2k.inp";

const COORDINATES_HEADER: &str = "MODULE QUICKSTEP: ATOMIC COORDINATES IN ANGSTROM";
const ENERGY_LINE: &str = "ENERGY| Total FORCE_EVAL ( QS ) energy [a.u.]";
const FORCES_HEADER: &str = "ATOMIC FORCES in [a.u.]";
const BLOCK_OFFSET: usize = 3;
const POSITION_TOLERANCE: f64 = 1e-2;
const MAX_MULTIPLICITY: u8 = 15;

fn malformed(message: impl Into<String>) -> EngineError {
    EngineError::Template {
        format: "cp2k",
        message: message.into(),
    }
}

/// A node of a CP2K input file: `&NAME [parameter]`, keywords and subsections.
///
/// Names are matched case-insensitively but written back as given.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Section {
    pub name: String,
    pub parameter: Option<String>,
    pub keywords: Vec<(String, String)>,
    pub sections: Vec<Section>,
}

impl Section {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Parses a complete input file into an unnamed root section.
    pub fn parse(input: &str) -> Result<Self, EngineError> {
        let mut stack = vec![Section::default()];
        for (number, raw) in input.lines().enumerate() {
            let line_number = number + 1;
            let line = raw.split(['#', '!']).next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('@') {
                return Err(malformed(format!(
                    "line {line_number}: preprocessor directives are not supported"
                )));
            }
            let (head, rest) = match line.split_once(char::is_whitespace) {
                Some((head, rest)) => (head, rest.trim()),
                None => (line, ""),
            };
            if head.eq_ignore_ascii_case("&END") {
                let section = stack
                    .pop()
                    .filter(|_| !stack.is_empty())
                    .ok_or_else(|| malformed(format!("line {line_number}: &END without open section")))?;
                if !rest.is_empty() && !rest.eq_ignore_ascii_case(&section.name) {
                    return Err(malformed(format!(
                        "line {line_number}: &END {rest} closes section {}",
                        section.name
                    )));
                }
                if let Some(parent) = stack.last_mut() {
                    parent.sections.push(section);
                }
            } else if let Some(name) = head.strip_prefix('&') {
                if name.is_empty() {
                    return Err(malformed(format!("line {line_number}: section without a name")));
                }
                let mut section = Section::new(name);
                section.parameter = (!rest.is_empty()).then(|| rest.to_string());
                stack.push(section);
            } else if let Some(current) = stack.last_mut() {
                current.keywords.push((head.to_string(), rest.to_string()));
            }
        }
        if stack.len() != 1 {
            let open = stack.last().map(|s| s.name.clone()).unwrap_or_default();
            return Err(malformed(format!("section {open} is never closed")));
        }
        stack.pop().ok_or_else(|| malformed("empty input"))
    }

    /// Writes the children of this section in CP2K syntax.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            section.render_into(&mut out, 0);
        }
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        let _ = match &self.parameter {
            Some(parameter) => writeln!(out, "{indent}&{} {parameter}", self.name),
            None => writeln!(out, "{indent}&{}", self.name),
        };
        for (keyword, value) in &self.keywords {
            let _ = if value.is_empty() {
                writeln!(out, "{indent}  {keyword}")
            } else {
                writeln!(out, "{indent}  {keyword} {value}")
            };
        }
        for section in &self.sections {
            section.render_into(out, depth + 1);
        }
        let _ = writeln!(out, "{indent}&END {}", self.name);
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn section_mut(&mut self, name: &str) -> Option<&mut Section> {
        self.sections.iter_mut().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    /// Returns the subsection `name`, creating it if needed.
    pub fn ensure_section(&mut self, name: &str) -> &mut Section {
        let index = match self.sections.iter().position(|s| s.name.eq_ignore_ascii_case(name)) {
            Some(index) => index,
            None => {
                self.sections.push(Section::new(name.to_ascii_uppercase()));
                self.sections.len() - 1
            }
        };
        &mut self.sections[index]
    }

    pub fn remove_section(&mut self, name: &str) {
        self.sections.retain(|s| !s.name.eq_ignore_ascii_case(name));
    }

    pub fn keyword(&self, name: &str) -> Option<&str> {
        self.keywords
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces every occurrence of `name` with a single `name value` entry.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.keywords.iter().position(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(index) => {
                self.keywords[index].1 = value;
                let mut seen = false;
                self.keywords.retain(|(k, _)| {
                    if !k.eq_ignore_ascii_case(name) {
                        return true;
                    }
                    let keep = !seen;
                    seen = true;
                    keep
                });
            }
            None => self.keywords.push((name.to_ascii_uppercase(), value)),
        }
    }

    pub fn set_default(&mut self, name: &str, value: impl Into<String>) {
        if self.keyword(name).is_none() {
            self.set(name, value);
        }
    }
}

/// CP2K single-point calculations.
#[derive(Debug, Clone, PartialEq)]
pub struct Cp2k {
    input: Section,
}

impl Cp2k {
    pub fn new(input: &str) -> Result<Self, EngineError> {
        let input = Section::parse(input)?;
        input
            .section("FORCE_EVAL")
            .ok_or_else(|| malformed("input has no FORCE_EVAL section"))?;
        Ok(Self { input })
    }

    pub fn input(&self) -> &Section {
        &self.input
    }

    fn force_eval_mut(input: &mut Section) -> Result<&mut Section, EngineError> {
        input
            .section_mut("FORCE_EVAL")
            .ok_or_else(|| malformed("input has no FORCE_EVAL section"))
    }

    /// The input for a single point on `geometry`.
    pub fn single_point(&self, geometry: &Geometry, properties: &[Property]) -> Result<String, EngineError> {
        if !geometry.periodic() {
            return Err(malformed("CP2K calculations require a periodic geometry"));
        }
        let mut input = self.input.clone();
        let global = input.ensure_section("GLOBAL");
        global.set("RUN_TYPE", run_type(properties)?);
        global.set_default("PREFERRED_DIAG_LIBRARY", "SL");
        if global.section("FM").is_none() {
            global
                .ensure_section("FM")
                .set("TYPE_OF_MATRIX_MULTIPLICATION", "SCALAPACK");
        }

        let force_eval = Self::force_eval_mut(&mut input)?;
        let subsys = force_eval.ensure_section("SUBSYS");
        subsys.remove_section("TOPOLOGY");
        subsys.remove_section("COORD");
        subsys.remove_section("CELL");
        let mut coord = Section::new("COORD");
        for atom in geometry.atoms() {
            let symbol = element::symbol(atom.number).unwrap_or("X");
            let p = atom.position;
            coord
                .keywords
                .push((symbol.to_string(), format!("{} {} {}", p.x, p.y, p.z)));
        }
        let mut cell = Section::new("CELL");
        for (label, row) in ["A", "B", "C"].into_iter().zip(geometry.cell().row_iter()) {
            cell.keywords
                .push((label.to_string(), format!("{} {} {}", row[0], row[1], row[2])));
        }
        subsys.sections.push(coord);
        subsys.sections.push(cell);
        if properties.contains(&Property::Forces) {
            force_eval.ensure_section("PRINT").ensure_section("FORCES");
        }
        Ok(input.render())
    }

    /// Spin-polarized variant at the given multiplicity, used for isolated atoms.
    pub fn with_multiplicity(&self, multiplicity: u8) -> Result<Self, EngineError> {
        let mut input = self.input.clone();
        let dft = Self::force_eval_mut(&mut input)?
            .section_mut("DFT")
            .ok_or_else(|| malformed("FORCE_EVAL has no DFT section"))?;
        dft.set("UKS", "TRUE");
        dft.set("MULTIPLICITY", multiplicity.to_string());
        dft.set("CHARGE", "0");
        if let Some(xc) = dft.section_mut("XC") {
            xc.remove_section("VDW_POTENTIAL");
        }
        dft.ensure_section("SCF").ensure_section("OT").set("MINIMIZER", "CG");
        Ok(Self { input })
    }
}

fn run_type(properties: &[Property]) -> Result<&'static str, EngineError> {
    match properties {
        [Property::Energy] => Ok("ENERGY"),
        [Property::Energy, Property::Forces] => Ok("ENERGY_FORCE"),
        other => Err(malformed(format!("unsupported properties {other:?}"))),
    }
}

/// Multiplicities an isolated atom of atomic number `number` can have.
pub fn allowed_multiplicities(number: u8) -> impl Iterator<Item = u8> {
    (1..=MAX_MULTIPLICITY).filter(move |m| (m - 1) % 2 == number % 2 && m - 1 <= number)
}

fn block<'a>(lines: &[&'a str], header: &str, natoms: usize) -> Option<Vec<&'a str>> {
    let start = lines.iter().rposition(|l| l.trim().starts_with(header))? + BLOCK_OFFSET;
    let block = lines.get(start..start + natoms)?;
    Some(block.to_vec())
}

fn columns(line: &str, range: std::ops::Range<usize>) -> Option<Vector3<f64>> {
    let values: Vec<f64> = line
        .split_whitespace()
        .skip(range.start)
        .take(range.len())
        .map(|v| v.parse().ok())
        .collect::<Option<_>>()?;
    (values.len() == 3).then(|| Vector3::new(values[0], values[1], values[2]))
}

/// Labels `geometry` from CP2K standard output, or returns `None` when the
/// output is incomplete or inconsistent with the input geometry.
pub fn parse_output(stdout: &str, properties: &[Property], geometry: &Geometry) -> Option<Geometry> {
    let lines: Vec<&str> = stdout.lines().collect();
    let natoms = geometry.natoms();

    // Diverged SCF runs print '***' instead of coordinates.
    let coordinates = block(&lines, COORDINATES_HEADER, natoms)?;
    for (line, atom) in coordinates.iter().zip(geometry.atoms()) {
        let position = columns(line, 4..7)?;
        if (position - atom.position).amax() > POSITION_TOLERANCE {
            debug!("CP2K coordinates do not match the submitted geometry");
            return None;
        }
    }

    let energy: f64 = lines
        .iter()
        .rev()
        .find(|l| l.trim().starts_with(ENERGY_LINE))
        .and_then(|l| l.split_whitespace().last())
        .and_then(|v| v.parse().ok())?;

    let mut labeled = geometry.clone();
    labeled.energy = Some(energy * HARTREE);
    labeled.stress = None;
    for atom in labeled.atoms_mut() {
        atom.force = Vector3::repeat(f64::NAN);
    }
    if properties.contains(&Property::Forces) {
        let forces = block(&lines, FORCES_HEADER, natoms)?;
        for (line, atom) in forces.iter().zip(labeled.atoms_mut()) {
            atom.force = columns(line, 3..6)? * (HARTREE / BOHR);
        }
    }
    Some(labeled)
}

impl ReferenceBackend for Cp2k {
    fn name(&self) -> &'static str {
        "cp2k"
    }

    fn prepare(&self, geometry: &Geometry, properties: &[Property]) -> Result<Vec<InputFile>, EngineError> {
        Ok(vec![InputFile::contents(INPUT_FILE, self.single_point(geometry, properties)?)])
    }

    fn arguments(&self) -> Vec<String> {
        vec!["-i".to_string(), INPUT_FILE.to_string()]
    }

    fn parse(&self, stdout: &str, properties: &[Property], geometry: &Geometry) -> Option<Geometry> {
        parse_output(stdout, properties, geometry)
    }

    fn single_atom_variants(&self, number: u8) -> Result<Vec<(String, Arc<dyn ReferenceBackend>)>, EngineError> {
        allowed_multiplicities(number)
            .map(|m| {
                let variant: Arc<dyn ReferenceBackend> = Arc::new(self.with_multiplicity(m)?);
                Ok((format!("multiplicity {m}"), variant))
            })
            .collect()
    }
}

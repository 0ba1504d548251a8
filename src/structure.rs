use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::domain::{IdType, InchiKey};
use crate::error::MolidError;

#[derive(Debug, Clone, PartialEq)]
pub struct Atom {
    pub element: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Cartesian geometry, the common currency for file-based searches.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Geometry {
    pub atoms: Vec<Atom>,
}

impl Geometry {
    /// Parses XYZ text: atom count, a comment line, then `El x y z` rows.
    pub fn from_xyz(text: &str) -> Result<Self, MolidError> {
        let mut lines = text.lines();
        let count = lines
            .next()
            .map(str::trim)
            .ok_or_else(|| MolidError::Conversion("empty XYZ input".to_string()))?
            .parse::<usize>()
            .map_err(|_| MolidError::Conversion("XYZ atom count is not a number".to_string()))?;
        lines.next();

        let mut atoms = Vec::with_capacity(count);
        for line in lines.filter(|line| !line.trim().is_empty()) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return Err(MolidError::Conversion(format!("bad XYZ atom line: {line}")));
            }
            atoms.push(Atom {
                element: fields[0].to_string(),
                x: parse_coordinate(fields[1])?,
                y: parse_coordinate(fields[2])?,
                z: parse_coordinate(fields[3])?,
            });
        }
        if atoms.len() != count {
            return Err(MolidError::Conversion(format!(
                "XYZ declares {count} atoms but lists {}",
                atoms.len()
            )));
        }
        Ok(Self { atoms })
    }

    /// Reads the atom block of the first V2000 molfile in an SDF document.
    pub fn from_molfile(text: &str) -> Result<Self, MolidError> {
        let lines: Vec<&str> = text.lines().collect();
        let counts: &str = lines
            .get(3)
            .copied()
            .ok_or_else(|| MolidError::Conversion("molfile has no counts line".to_string()))?;
        let count = counts
            .get(..3)
            .unwrap_or(counts)
            .trim()
            .parse::<usize>()
            .map_err(|_| MolidError::Conversion(format!("bad molfile counts line: {counts}")))?;

        let mut atoms = Vec::with_capacity(count);
        for line in lines.iter().skip(4).take(count) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return Err(MolidError::Conversion(format!("bad molfile atom line: {line}")));
            }
            atoms.push(Atom {
                element: fields[3].to_string(),
                x: parse_coordinate(fields[0])?,
                y: parse_coordinate(fields[1])?,
                z: parse_coordinate(fields[2])?,
            });
        }
        if atoms.len() != count {
            return Err(MolidError::Conversion(format!(
                "molfile declares {count} atoms but lists {}",
                atoms.len()
            )));
        }
        Ok(Self { atoms })
    }

    pub fn to_xyz(&self) -> String {
        let mut out = format!("{}\n\n", self.atoms.len());
        for atom in &self.atoms {
            let _ = writeln!(
                out,
                "{} {:.6} {:.6} {:.6}",
                atom.element, atom.x, atom.y, atom.z
            );
        }
        out
    }
}

fn parse_coordinate(value: &str) -> Result<f64, MolidError> {
    value
        .parse::<f64>()
        .map_err(|_| MolidError::Conversion(format!("bad coordinate: {value}")))
}

pub trait StructureConverter {
    fn structure_to_inchikey(&self, geometry: &Geometry) -> Result<InchiKey, MolidError>;
    fn identifier_to_inchikey(&self, value: &str, id_type: IdType)
    -> Result<InchiKey, MolidError>;
}

/// Converts through the Open Babel command line tool.
#[derive(Clone)]
pub struct ObabelConverter {
    obabel: Option<PathBuf>,
}

impl ObabelConverter {
    pub fn new() -> Self {
        Self {
            obabel: find_in_path("obabel"),
        }
    }

    fn require_obabel(&self) -> Result<&PathBuf, MolidError> {
        self.obabel
            .as_ref()
            .ok_or_else(|| MolidError::MissingTool("obabel".to_string()))
    }

    fn run_obabel(&self, args: &[String]) -> Result<InchiKey, MolidError> {
        let program = self.require_obabel()?;
        debug!(program = %program.display(), ?args, "running converter");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| MolidError::Conversion(err.to_string()))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let key = stdout.lines().map(str::trim).find(|line| !line.is_empty());
        match key {
            Some(key) if output.status.success() => key
                .parse::<InchiKey>()
                .map_err(|_| MolidError::Conversion(format!("obabel produced no InChIKey: {key}"))),
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                Err(MolidError::Conversion(if stderr.is_empty() {
                    format!("command failed: {}", program.display())
                } else {
                    stderr
                }))
            }
        }
    }
}

impl Default for ObabelConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl StructureConverter for ObabelConverter {
    fn structure_to_inchikey(&self, geometry: &Geometry) -> Result<InchiKey, MolidError> {
        self.require_obabel()?;
        let mut file = tempfile::Builder::new()
            .prefix("molid-")
            .suffix(".xyz")
            .tempfile()
            .map_err(|err| MolidError::Filesystem(err.to_string()))?;
        file.write_all(geometry.to_xyz().as_bytes())
            .and_then(|()| file.flush())
            .map_err(|err| MolidError::Filesystem(err.to_string()))?;
        let args = vec![
            "-ixyz".to_string(),
            path_arg(file.path()),
            "-oinchikey".to_string(),
        ];
        self.run_obabel(&args)
    }

    fn identifier_to_inchikey(
        &self,
        value: &str,
        id_type: IdType,
    ) -> Result<InchiKey, MolidError> {
        let format = match id_type {
            IdType::Smiles => "-ismi",
            IdType::Inchi => "-iinchi",
            IdType::Inchikey => return value.parse(),
            other => {
                return Err(MolidError::Conversion(format!(
                    "cannot derive an InChIKey from {other}"
                )));
            }
        };
        let args = vec![
            format!("-:{}", value.trim()),
            format.to_string(),
            "-oinchikey".to_string(),
        ];
        self.run_obabel(&args)
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

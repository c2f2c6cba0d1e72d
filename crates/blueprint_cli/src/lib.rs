use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use construction::{
    write_blueprint_file, Blueprint, BlueprintId, BlueprintLibrary, BlueprintUnit, ContentState,
    DirectorySource, ExtraData, Footprint, IntVec3, MaterialCatalog, MaterialLedger, Rotation,
    ValidationLimits,
};
use serde::Deserialize;

pub const DEFAULT_BLUEPRINT_ROOT: &str = "data/blueprints";

#[derive(Debug, Clone)]
pub struct CommonOptions {
    pub root: PathBuf,
    pub catalog: Option<PathBuf>,
    pub max_extent: Option<i32>,
}

impl Default for CommonOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_BLUEPRINT_ROOT),
            catalog: None,
            max_extent: None,
        }
    }
}

impl CommonOptions {
    fn limits(&self) -> ValidationLimits {
        match self.max_extent {
            Some(max_extent) => ValidationLimits { max_extent },
            None => ValidationLimits::default(),
        }
    }
}

pub enum CommandKind {
    Inspect { id: String, rotation: Option<i32> },
    Materials { id: String },
    Compile { source: PathBuf, id: String, out: Option<PathBuf> },
    List,
}

/// JSON authoring form of a blueprint. `content` of a unit names a palette
/// entry, or a bare content kind when no entry has that name.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthoringDoc {
    pub dimensions: IntVec3,
    #[serde(default)]
    pub palette: BTreeMap<String, ContentState>,
    pub units: Vec<AuthoredUnit>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthoredUnit {
    pub position: IntVec3,
    pub content: String,
    #[serde(default)]
    pub extra_data: ExtraData,
}

impl AuthoringDoc {
    pub fn parse(raw: &str) -> Result<Self, String> {
        serde_json::from_str(raw).map_err(|error| format!("invalid authoring document: {error}"))
    }

    pub fn into_units(self) -> (IntVec3, Vec<BlueprintUnit>) {
        let palette = self.palette;
        let units = self
            .units
            .into_iter()
            .map(|unit| {
                let content = palette
                    .get(&unit.content)
                    .cloned()
                    .unwrap_or_else(|| ContentState::new(unit.content));
                BlueprintUnit {
                    position: unit.position,
                    content,
                    extra_data: unit.extra_data,
                }
            })
            .collect();
        (self.dimensions, units)
    }
}

pub fn run<W: Write>(kind: CommandKind, opts: CommonOptions, stdout: &mut W) -> Result<(), String> {
    match kind {
        CommandKind::Inspect { id, rotation } => inspect(&opts, &id, rotation, stdout),
        CommandKind::Materials { id } => materials(&opts, &id, stdout),
        CommandKind::Compile { source, id, out } => {
            compile(&opts, &source, &id, out.as_deref(), stdout)
        }
        CommandKind::List => list(&opts, stdout),
    }
}

fn load(opts: &CommonOptions, id: &str) -> Result<std::sync::Arc<Blueprint>, String> {
    let mut library = BlueprintLibrary::new(DirectorySource::new(opts.root.clone()), opts.limits());
    library
        .load(&BlueprintId::new(id))
        .map_err(|error| error.to_string())
}

fn inspect<W: Write>(
    opts: &CommonOptions,
    id: &str,
    rotation: Option<i32>,
    stdout: &mut W,
) -> Result<(), String> {
    let blueprint = load(opts, id)?;
    let dims = blueprint.dimensions();
    emit(stdout, &format!("blueprint {}", blueprint.id()))?;
    emit(stdout, &format!("  dimensions {}x{}x{}", dims.x, dims.y, dims.z))?;
    emit(
        stdout,
        &format!(
            "  units {} ({} to build)",
            blueprint.units().len(),
            blueprint.non_void_count()
        ),
    )?;
    emit(stdout, &format!("  sha256 {}", blueprint.source_hash()))?;
    for (kind, count) in blueprint.materials() {
        emit(stdout, &format!("  content {kind} x{count}"))?;
    }

    if let Some(degrees) = rotation {
        let rotation = Rotation::from_degrees(degrees)
            .ok_or_else(|| format!("invalid rotation {degrees} (expected 0, 90, 180 or 270)"))?;
        match Footprint::from_positions(blueprint.footprint(IntVec3::ZERO, rotation)) {
            Some(footprint) => emit(
                stdout,
                &format!(
                    "  footprint at {rotation} from origin: {} .. {} ({} occupied)",
                    footprint.min, footprint.max, footprint.occupied
                ),
            )?,
            None => emit(stdout, "  footprint empty")?,
        }
    }
    Ok(())
}

fn materials<W: Write>(opts: &CommonOptions, id: &str, stdout: &mut W) -> Result<(), String> {
    let blueprint = load(opts, id)?;
    let catalog = match &opts.catalog {
        Some(path) => MaterialCatalog::load(path).map_err(|error| error.to_string())?,
        None => MaterialCatalog::passthrough(),
    };
    let requirements = MaterialLedger::new(catalog).compute_requirements(&blueprint);
    if requirements.is_empty() {
        return emit(stdout, "no materials required");
    }
    for (resource, quantity) in &requirements {
        emit(stdout, &format!("{resource} {quantity}"))?;
    }
    Ok(())
}

fn compile<W: Write>(
    opts: &CommonOptions,
    source: &Path,
    id: &str,
    out: Option<&Path>,
    stdout: &mut W,
) -> Result<(), String> {
    let raw = fs::read_to_string(source)
        .map_err(|error| format!("failed to read '{}': {error}", source.display()))?;
    let (dimensions, units) = AuthoringDoc::parse(&raw)?.into_units();
    let identifier = BlueprintId::new(id);
    let blueprint =
        Blueprint::from_units(identifier.clone(), dimensions, units, String::new(), opts.limits())
            .map_err(|error| error.to_string())?;

    let target = match out {
        Some(path) => path.to_path_buf(),
        None => DirectorySource::new(opts.root.clone()).path_for(&identifier),
    };
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .map_err(|error| format!("failed to create '{}': {error}", parent.display()))?;
    }
    write_blueprint_file(&target, &blueprint).map_err(|error| error.to_string())?;
    emit(
        stdout,
        &format!(
            "compiled {} ({} units, {} to build) -> {}",
            identifier,
            blueprint.units().len(),
            blueprint.non_void_count(),
            target.display()
        ),
    )
}

fn list<W: Write>(opts: &CommonOptions, stdout: &mut W) -> Result<(), String> {
    let library = BlueprintLibrary::new(DirectorySource::new(opts.root.clone()), opts.limits());
    let ids = library
        .list()
        .map_err(|error| format!("failed to list '{}': {error}", opts.root.display()))?;
    for id in ids {
        emit(stdout, id.as_str())?;
    }
    Ok(())
}

fn emit<W: Write>(stdout: &mut W, line: &str) -> Result<(), String> {
    writeln!(stdout, "{line}").map_err(|error| format!("failed to write output: {error}"))
}

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use construction::{
    load_building_book, BlueprintLibrary, BuildingBook, CatalogError, ConfigError,
    ConstructionConfig, ConstructionPipeline, DirectorySource, MaterialCatalog, MaterialLedger,
    PersistError,
};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use super::orders::{OrdersError, Scenario};

pub(crate) const ROOT_ENV_VAR: &str = "COLONY_ROOT";
const REALTIME_ENV_VAR: &str = "COLONY_REALTIME";
const MAX_TICKS_ENV_VAR: &str = "COLONY_MAX_TICKS";
const RESUME_ENV_VAR: &str = "COLONY_RESUME";

#[derive(Debug, Clone)]
pub(crate) struct DataPaths {
    pub(crate) root: PathBuf,
    pub(crate) blueprints_dir: PathBuf,
    pub(crate) material_defs: PathBuf,
    pub(crate) config_file: PathBuf,
    pub(crate) orders_file: PathBuf,
    pub(crate) saves_dir: PathBuf,
}

impl DataPaths {
    pub(crate) fn under(root: &Path) -> Self {
        let data = root.join("data");
        Self {
            root: root.to_path_buf(),
            blueprints_dir: data.join("blueprints"),
            material_defs: data.join("defs").join("materials.xml"),
            config_file: data.join("config.json"),
            orders_file: data.join("orders.json"),
            saves_dir: root.join("saves"),
        }
    }

    pub(crate) fn buildings_save(&self) -> PathBuf {
        self.saves_dir.join("buildings.json")
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LoopConfig {
    pub(crate) target_tps: u32,
    /// Hard stop for runs whose buildings never settle.
    pub(crate) max_ticks: u64,
    pub(crate) summary_interval_ticks: u64,
    /// Sleep to hold `target_tps`; otherwise ticks run back to back.
    pub(crate) realtime: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            target_tps: 20,
            max_ticks: 72_000,
            summary_interval_ticks: 200,
            realtime: false,
        }
    }
}

impl LoopConfig {
    pub(crate) fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.target_tps.max(1)))
    }
}

#[derive(Debug, Error)]
pub(crate) enum StartupError {
    #[error("failed to read environment variable {var}: {source}")]
    EnvVar {
        var: &'static str,
        #[source]
        source: env::VarError,
    },
    #[error("failed to resolve current executable path: {0}")]
    CurrentExe(#[source] std::io::Error),
    #[error("current executable path has no parent directory: {0}")]
    ExeHasNoParent(PathBuf),
    #[error("failed to create saves directory at {path}: {source}")]
    CreateSavesDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "COLONY_ROOT is set but does not point to a valid root: {path}\n\
A valid root must contain Cargo.toml and data/."
    )]
    InvalidEnvRoot { path: PathBuf },
    #[error(
        "Could not detect the colony root by walking upward from executable directory: {start_dir}\n\
Expected a directory containing Cargo.toml and data/.\n\
Set {env_var} explicitly, for example:\n\
Bash/zsh: export {env_var}=\"/path/to/colony\""
    )]
    RootNotFound {
        start_dir: PathBuf,
        env_var: &'static str,
    },
    #[error("COLONY_MAX_TICKS must be a positive integer, got {value:?}")]
    InvalidMaxTicks { value: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to load material defs: {0}")]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Orders(#[from] OrdersError),
    #[error(transparent)]
    Resume(#[from] PersistError),
}

pub(crate) struct AppWiring {
    pub(crate) paths: DataPaths,
    pub(crate) loop_config: LoopConfig,
    pub(crate) pipeline: ConstructionPipeline,
    pub(crate) scenario: Scenario,
    pub(crate) resume: Option<BuildingBook>,
}

pub(crate) fn build_app() -> Result<AppWiring, StartupError> {
    init_tracing();
    info!("=== Colony Startup ===");

    let paths = resolve_data_paths()?;
    let loop_config = LoopConfig {
        realtime: env_flag(REALTIME_ENV_VAR),
        max_ticks: parse_max_ticks_from_env()?.unwrap_or(LoopConfig::default().max_ticks),
        ..LoopConfig::default()
    };
    let mut app = build_app_from(paths, loop_config)?;
    if env_flag(RESUME_ENV_VAR) {
        let save = app.paths.buildings_save();
        if save.is_file() {
            let book = load_building_book(&save)?;
            info!(path = %save.display(), buildings = book.buildings.len(), "resuming_from_save");
            app.resume = Some(book);
        }
    }
    Ok(app)
}

/// Everything after path resolution. Split out so a run can be wired
/// against any directory.
pub(crate) fn build_app_from(
    paths: DataPaths,
    loop_config: LoopConfig,
) -> Result<AppWiring, StartupError> {
    fs::create_dir_all(&paths.saves_dir).map_err(|source| StartupError::CreateSavesDir {
        path: paths.saves_dir.clone(),
        source,
    })?;
    info!(
        root = %paths.root.display(),
        blueprints_dir = %paths.blueprints_dir.display(),
        saves_dir = %paths.saves_dir.display(),
        "startup"
    );

    let config = ConstructionConfig::load_or_default(&paths.config_file)?;
    let catalog = if paths.material_defs.is_file() {
        MaterialCatalog::load(&paths.material_defs)?
    } else {
        info!(path = %paths.material_defs.display(), "material_defs_missing_using_passthrough");
        MaterialCatalog::passthrough()
    };
    info!(
        mappings = catalog.len(),
        passthrough = catalog.is_passthrough(),
        "material_catalog_loaded"
    );
    let scenario = Scenario::load_or_empty(&paths.orders_file)?;

    let library = BlueprintLibrary::new(
        DirectorySource::new(paths.blueprints_dir.clone()),
        config.validation_limits(),
    );
    let mut pipeline = ConstructionPipeline::new(config, library, MaterialLedger::new(catalog));
    for seed in &scenario.settlements {
        pipeline.add_settlement(seed.id, seed.store.clone());
    }
    info!(
        settlements = scenario.settlements.len(),
        orders = scenario.orders.len(),
        "scenario_loaded"
    );

    Ok(AppWiring {
        paths,
        loop_config,
        pipeline,
        scenario,
        resume: None,
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .init();
}

fn env_flag(var: &str) -> bool {
    env::var(var)
        .map(|raw| matches!(raw.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn parse_max_ticks_from_env() -> Result<Option<u64>, StartupError> {
    let Ok(raw) = env::var(MAX_TICKS_ENV_VAR) else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(Some(value)),
        _ => Err(StartupError::InvalidMaxTicks { value: raw }),
    }
}

fn resolve_data_paths() -> Result<DataPaths, StartupError> {
    resolve_root().map(|root| DataPaths::under(&root))
}

fn resolve_root() -> Result<PathBuf, StartupError> {
    match env::var(ROOT_ENV_VAR) {
        Ok(value) => {
            let normalized = normalize_path(&PathBuf::from(value));
            if is_root_marker(&normalized) {
                Ok(normalized)
            } else {
                Err(StartupError::InvalidEnvRoot { path: normalized })
            }
        }
        Err(env::VarError::NotPresent) => {
            let exe = env::current_exe().map_err(StartupError::CurrentExe)?;
            let exe_dir = exe
                .parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| StartupError::ExeHasNoParent(exe.clone()))?;

            for candidate in exe_dir.ancestors() {
                if is_root_marker(candidate) {
                    return Ok(normalize_path(candidate));
                }
            }

            Err(StartupError::RootNotFound {
                start_dir: normalize_path(&exe_dir),
                env_var: ROOT_ENV_VAR,
            })
        }
        Err(source) => Err(StartupError::EnvVar {
            var: ROOT_ENV_VAR,
            source,
        }),
    }
}

fn is_root_marker(path: &Path) -> bool {
    path.join("Cargo.toml").is_file() && path.join("data").is_dir()
}

fn normalize_path(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

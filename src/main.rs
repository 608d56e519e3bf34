//! Command line front end: run one engine operation against a data
//! directory and print the JSON result.
//!
//! ```text
//! rusty-phenotype --data data/ feature-info cellmorph
//! rusty-phenotype --data data/ histograms cellmorph \
//!     --features '["area","eccentricity"]' --exemplars '{"2":[10,11],"3":[40]}' --bins 20
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use serde_json::Value;

use rusty_phenotype::api;
use rusty_phenotype::data::model::WellCoord;
use rusty_phenotype::{DirectorySource, Engine, EngineConfig};

#[derive(Parser, Debug)]
#[command(name = "rusty-phenotype")]
#[command(version)]
#[command(about = "Per-object feature exploration for microplate screens", long_about = None)]
struct Cli {
    /// Directory holding `<dataset>.parquet|csv|json` files
    #[arg(long, default_value = "data")]
    data: PathBuf,

    /// Engine config JSON (cache capacities, forest settings, ...)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker threads; overrides the config file
    #[arg(long)]
    threads: Option<usize>,

    /// Log cache statistics after the command
    #[arg(long)]
    stats: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the datasets found in the data directory
    Datasets,
    /// Image features in display order
    FeatureInfo(DatasetArgs),
    /// Min / max / mean of every image feature
    Metrics(DatasetArgs),
    /// Object ids per well
    Wells(DatasetArgs),
    /// Per-well annotation table
    Annotations(DatasetArgs),
    /// Population id of every object
    Clusters(ClassArgs),
    /// Object ids per population
    ClusterMap(ClassArgs),
    /// Population shares per well
    Shares(ClassArgs),
    /// Per-population histograms of every image feature
    Histograms(BinnedArgs),
    /// Per-population contour maps of every feature pair
    Contours(BinnedArgs),
    /// Object nearest to a probe point
    Closest(ProbeArgs),
    /// Exemplars, well objects and the probed object
    Objects(ObjectArgs),
    /// Detail records of the resolved objects
    ObjectInfo(ObjectInfoArgs),
    /// Image feature values of the resolved objects
    ObjectValues(ObjectArgs),
    /// Detail records of explicit objects
    Records(RecordArgs),
}

#[derive(Args, Debug)]
struct DatasetArgs {
    dataset: String,
}

#[derive(Args, Debug)]
struct ClassArgs {
    dataset: String,

    /// JSON array of feature names
    #[arg(long, default_value = "[]")]
    features: String,

    /// JSON object, population id → object ids
    #[arg(long, default_value = "{}")]
    exemplars: String,
}

#[derive(Args, Debug)]
struct BinnedArgs {
    #[command(flatten)]
    class: ClassArgs,

    #[arg(long, default_value_t = 20)]
    bins: usize,
}

#[derive(Args, Debug)]
struct ProbeArgs {
    dataset: String,

    /// JSON object, feature → scaled coordinate
    #[arg(long, default_value = "")]
    probes: String,
}

#[derive(Args, Debug)]
struct WellArgs {
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    plate: i64,
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    row: i64,
    /// Negative means no well selected
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    column: i64,
}

impl WellArgs {
    fn coord(&self) -> WellCoord {
        WellCoord::new(self.plate, self.row, self.column)
    }
}

#[derive(Args, Debug)]
struct ObjectArgs {
    dataset: String,

    #[command(flatten)]
    well: WellArgs,

    #[arg(long, default_value = "{}")]
    exemplars: String,

    #[arg(long, default_value = "")]
    probes: String,
}

#[derive(Args, Debug)]
struct ObjectInfoArgs {
    #[command(flatten)]
    objects: ObjectArgs,

    #[arg(long, default_value = "[]")]
    features: String,
}

#[derive(Args, Debug)]
struct RecordArgs {
    dataset: String,

    /// JSON array of object ids
    #[arg(long)]
    objects: String,

    #[arg(long, default_value = "[]")]
    features: String,
}

fn run(engine: &Engine, command: &Commands) -> rusty_phenotype::Result<Value> {
    match command {
        Commands::Datasets => api::datasets(engine),
        Commands::FeatureInfo(a) => api::feature_info(engine, &a.dataset),
        Commands::Metrics(a) => api::feature_metrics(engine, &a.dataset),
        Commands::Wells(a) => api::well_to_objects(engine, &a.dataset),
        Commands::Annotations(a) => api::well_annotations(engine, &a.dataset),
        Commands::Clusters(a) => api::clusters(engine, &a.dataset, &a.features, &a.exemplars),
        Commands::ClusterMap(a) => api::clusters_as_map(engine, &a.dataset, &a.features, &a.exemplars),
        Commands::Shares(a) => api::well_cluster_shares(engine, &a.dataset, &a.features, &a.exemplars),
        Commands::Histograms(a) => {
            let c = &a.class;
            api::feature_histograms(engine, &c.dataset, &c.features, &c.exemplars, a.bins)
        }
        Commands::Contours(a) => {
            let c = &a.class;
            api::contour_maps(engine, &c.dataset, &c.features, &c.exemplars, a.bins)
        }
        Commands::Closest(a) => api::closest_object(engine, &a.dataset, &a.probes),
        Commands::Objects(a) => api::objects(engine, &a.dataset, a.well.coord(), &a.exemplars, &a.probes),
        Commands::ObjectInfo(a) => {
            let o = &a.objects;
            api::object_info(engine, &o.dataset, &a.features, o.well.coord(), &o.exemplars, &o.probes)
        }
        Commands::ObjectValues(a) => {
            api::object_feature_values(engine, &a.dataset, a.well.coord(), &a.exemplars, &a.probes)
        }
        Commands::Records(a) => api::object_records(engine, &a.dataset, &a.features, &a.objects),
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(threads) = cli.threads {
        config.worker_threads = threads;
    }

    let source = DirectorySource::open(&cli.data)
        .with_context(|| format!("opening data directory {}", cli.data.display()))?;
    let engine = Engine::new(Arc::new(source), config)?;

    let outcome = run(&engine, &cli.command);
    if cli.stats {
        info!("cache stats: {}", serde_json::to_string(&engine.stats())?);
    }
    match outcome {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(err) => {
            println!("{}", serde_json::to_string_pretty(&api::error_response(&err))?);
            std::process::exit(1);
        }
    }
}

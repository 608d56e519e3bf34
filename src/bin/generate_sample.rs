//! Writes a synthetic screen: `<name>.parquet` with one row per cell and
//! `<name>.config.json` with well image templates.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{ArrayRef, Float64Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use clap::Parser;
use parquet::arrow::ArrowWriter;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use rusty_phenotype::data::model::DatasetConfig;

const ROWS: i64 = 16;
const COLUMNS: i64 = 24;

const FEATURES: [&str; 7] = [
    "area",
    "perimeter",
    "eccentricity",
    "nucleus_area",
    "dna_intensity",
    "actin_intensity",
    "texture_entropy",
];

/// Mean and spread of every feature for one phenotype.
struct Phenotype {
    name: &'static str,
    profile: [(f64, f64); 7],
}

const PHENOTYPES: [Phenotype; 3] = [
    Phenotype {
        name: "interphase",
        profile: [
            (900.0, 120.0),
            (120.0, 12.0),
            (0.45, 0.08),
            (300.0, 40.0),
            (1.0, 0.15),
            (0.8, 0.2),
            (4.0, 0.4),
        ],
    },
    Phenotype {
        name: "mitotic",
        profile: [
            (600.0, 80.0),
            (90.0, 8.0),
            (0.2, 0.05),
            (180.0, 30.0),
            (2.2, 0.3),
            (1.4, 0.25),
            (5.5, 0.5),
        ],
    },
    Phenotype {
        name: "apoptotic",
        profile: [
            (350.0, 90.0),
            (95.0, 15.0),
            (0.7, 0.1),
            (90.0, 25.0),
            (3.0, 0.6),
            (0.4, 0.15),
            (6.5, 0.7),
        ],
    },
];

#[derive(Parser, Debug)]
#[command(about = "Write a synthetic cell feature dataset")]
struct Cli {
    /// Output directory
    #[arg(long, default_value = "data")]
    out: PathBuf,

    /// Dataset name (file stem)
    #[arg(long, default_value = "cellmorph")]
    name: String,

    #[arg(long, default_value_t = 2)]
    plates: i64,

    /// Mean cells per well
    #[arg(long, default_value_t = 8)]
    cells_per_well: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

/// Phenotype mix of a well: later columns push cells out of interphase,
/// the last rows of each plate towards apoptosis.
fn well_mix(row: i64, column: i64) -> [f64; 3] {
    let mitotic = 0.05 + 0.35 * column as f64 / (COLUMNS - 1) as f64;
    let apoptotic = if row >= ROWS - 4 { 0.3 } else { 0.05 };
    [1.0 - mitotic - apoptotic, mitotic, apoptotic]
}

fn pick(mix: &[f64; 3], rng: &mut StdRng) -> usize {
    let mut u: f64 = rng.gen();
    for (i, share) in mix.iter().enumerate() {
        if u < *share {
            return i;
        }
        u -= share;
    }
    mix.len() - 1
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut rng = StdRng::seed_from_u64(cli.seed);

    let mut plate = Vec::new();
    let mut row = Vec::new();
    let mut column = Vec::new();
    let mut values: Vec<Vec<f64>> = vec![Vec::new(); FEATURES.len()];
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();

    for p in 0..cli.plates {
        for r in 0..ROWS {
            for c in 0..COLUMNS {
                let mix = well_mix(r, c);
                let cells = rng.gen_range(cli.cells_per_well / 2..=cli.cells_per_well * 3 / 2);
                for _ in 0..cells {
                    let phenotype = &PHENOTYPES[pick(&mix, &mut rng)];
                    *counts.entry(phenotype.name).or_default() += 1;
                    plate.push(p);
                    row.push(r);
                    column.push(c);
                    for (column_values, &(mean, sd)) in values.iter_mut().zip(&phenotype.profile) {
                        let normal = Normal::new(mean, sd).context("invalid feature profile")?;
                        column_values.push(normal.sample(&mut rng).max(0.0));
                    }
                }
            }
        }
    }

    let mut fields = vec![
        Field::new("plate", DataType::Int64, false),
        Field::new("row", DataType::Int64, false),
        Field::new("column", DataType::Int64, false),
    ];
    let n = plate.len();
    let mut arrays: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(plate)),
        Arc::new(Int64Array::from(row)),
        Arc::new(Int64Array::from(column)),
    ];
    for (name, column_values) in FEATURES.iter().zip(values) {
        fields.push(Field::new(*name, DataType::Float64, false));
        arrays.push(Arc::new(Float64Array::from(column_values)));
    }
    let schema = Arc::new(Schema::new(fields));
    let batch = RecordBatch::try_new(schema.clone(), arrays).context("building record batch")?;

    std::fs::create_dir_all(&cli.out)
        .with_context(|| format!("creating {}", cli.out.display()))?;

    let data_path = cli.out.join(format!("{}.parquet", cli.name));
    let file = std::fs::File::create(&data_path)
        .with_context(|| format!("creating {}", data_path.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema, None).context("creating parquet writer")?;
    writer.write(&batch).context("writing cells")?;
    writer.close().context("closing parquet writer")?;

    let config = DatasetConfig {
        well_images: BTreeMap::from([
            (
                "dna".to_string(),
                "images/{plate}/{row}_{column}_dna.png".to_string(),
            ),
            (
                "actin".to_string(),
                "images/{plate}/{row}_{column}_actin.png".to_string(),
            ),
        ]),
        image_features: Some(FEATURES.iter().map(|f| f.to_string()).collect()),
    };
    let config_path = cli.out.join(format!("{}.config.json", cli.name));
    std::fs::write(&config_path, serde_json::to_string_pretty(&config)?)
        .with_context(|| format!("writing {}", config_path.display()))?;

    println!(
        "Wrote {n} cells ({} plates × {ROWS} × {COLUMNS} wells) to {}",
        cli.plates,
        data_path.display()
    );
    for (name, count) in counts {
        println!("  {name}: {count}");
    }
    Ok(())
}

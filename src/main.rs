use anyhow::{anyhow, Context, Result};
use clap::Parser;
use itertools::iproduct;
use log::info;
use rayon::prelude::*;
use std::path;
use std::sync::Arc;

use convtile::cache::TilingCache;
use convtile::common::{ConvOp, Dtype, Format};
use convtile::orchestrator::{PlannerConfig, PlannerStats, TilingOrchestrator};
use convtile::pprint::{blob_hex, catalog_table, pprint_plan};
use convtile::repository::KnowledgeRepository;
use convtile::search::SearchConfig;
use convtile::shape::{ConvBuilder, PadMode};
use convtile::target::{PlatformBudget, TargetId};

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Target accelerator
    #[arg(long, value_enum, default_value_t = TargetId::Cube32)]
    target: TargetId,

    /// Tuned-plan repository file
    #[arg(long)]
    repo: Option<path::PathBuf>,

    /// Write searched plans into the repository
    #[arg(long, requires = "repo")]
    record: bool,

    #[arg(long)]
    no_cache: bool,

    /// Start L0 tiling from the basic-block list
    #[arg(long)]
    basic_block: bool,

    #[arg(long)]
    no_kernel_split: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct ShapeArgs {
    #[arg(long, value_enum, default_value_t = ConvOp::Forward)]
    op: ConvOp,
    #[arg(long, short, default_value = "1")]
    batch: i64,
    #[arg(long)]
    ci: i64,
    #[arg(long)]
    co: i64,
    /// Activation extent as D,H,W (the produced gradient for backprop input)
    #[arg(long, value_delimiter = ',', num_args = 3, required = true)]
    input: Vec<i64>,
    /// Kernel extent as D,H,W
    #[arg(long, value_delimiter = ',', num_args = 3, default_values_t = [1, 3, 3])]
    kernel: Vec<i64>,
    #[arg(long, value_delimiter = ',', num_args = 3, default_values_t = [1, 1, 1])]
    stride: Vec<i64>,
    #[arg(long, value_delimiter = ',', num_args = 3, default_values_t = [1, 1, 1])]
    dilation: Vec<i64>,
    /// Head, tail, top, bottom, left, right
    #[arg(long, value_delimiter = ',', num_args = 6, default_values_t = [0, 0, 0, 0, 0, 0])]
    pads: Vec<i64>,
    #[arg(long, value_enum, default_value_t = PadMode::Explicit)]
    pad_mode: PadMode,
    #[arg(long, default_value = "1")]
    groups: i64,
    #[arg(long, value_enum, default_value_t = Dtype::Float16)]
    dtype: Dtype,
    #[arg(long)]
    bias: bool,
    #[arg(long)]
    hf32: bool,
    #[arg(long, value_enum, default_value_t = Format::Ndc1hwc0)]
    fmap_format: Format,
    #[arg(long, value_enum, default_value_t = Format::FractalZ3d)]
    weight_format: Format,
    #[arg(long, value_enum, default_value_t = Format::Ndc1hwc0)]
    out_format: Format,
}

#[derive(clap::Subcommand)]
enum Command {
    #[command(about = "Plan one convolution")]
    Plan {
        #[command(flatten)]
        shape: ShapeArgs,
        /// Print the parameter blob
        #[arg(long)]
        hex: bool,
    },
    #[command(about = "Plan a grid of 2D forward convolutions in parallel")]
    Sweep {
        #[arg(long, value_delimiter = ',', default_values_t = [1, 8])]
        batch: Vec<i64>,
        #[arg(long, value_delimiter = ',', default_values_t = [16, 64, 256])]
        channels: Vec<i64>,
        #[arg(long, value_delimiter = ',', default_values_t = [14, 28, 56])]
        size: Vec<i64>,
        #[arg(long, value_delimiter = ',', default_values_t = [1, 3])]
        kernel: Vec<i64>,
        /// Number of passes over the grid
        #[arg(long, default_value = "2")]
        repeat: usize,
    },
    #[command(about = "Print the platform catalog")]
    Targets,
}

fn triple(name: &str, v: &[i64]) -> Result<[i64; 3]> {
    <[i64; 3]>::try_from(v).map_err(|_| anyhow!("--{name} takes D,H,W, got {} values", v.len()))
}

impl ShapeArgs {
    fn builder(&self) -> Result<ConvBuilder> {
        let pads = <[i64; 6]>::try_from(self.pads.as_slice())
            .map_err(|_| anyhow!("--pads takes 6 values, got {}", self.pads.len()))?;
        Ok(ConvBuilder::new(
            self.op,
            self.batch,
            self.ci,
            self.co,
            triple("input", &self.input)?,
            triple("kernel", &self.kernel)?,
        )
        .stride(triple("stride", &self.stride)?)
        .dilation(triple("dilation", &self.dilation)?)
        .pads(pads)
        .pad_mode(self.pad_mode)
        .groups(self.groups)
        .dtype(self.dtype)
        .bias(self.bias)
        .hf32(self.hf32)
        .formats(self.fmap_format, self.weight_format, self.out_format))
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let budget = PlatformBudget::for_target(args.target);

    let repository = Arc::new(match &args.repo {
        Some(path) => KnowledgeRepository::load(path)
            .with_context(|| format!("loading repository {}", path.display()))?,
        None => KnowledgeRepository::new(),
    });
    let config = PlannerConfig {
        use_cache: !args.no_cache,
        use_repository: args.repo.is_some(),
        record: args.record,
        search: SearchConfig {
            basic_block: args.basic_block,
            kernel_split: !args.no_kernel_split,
            ..SearchConfig::default()
        },
        ..PlannerConfig::default()
    };
    let orchestrator = TilingOrchestrator::with_config(budget, config)
        .with_repository(Arc::clone(&repository));

    match &args.command {
        Command::Plan { shape, hex } => {
            let request = shape.builder()?.build();
            let plan = orchestrator.plan(&request).context("planning failed")?;
            pprint_plan(&plan, budget);
            if *hex {
                println!("{}", blob_hex(&plan.result.blob));
            }
        }
        Command::Sweep {
            batch,
            channels,
            size,
            kernel,
            repeat,
        } => {
            let grid = iproduct!(batch, channels, channels, size, kernel)
                .map(|(&b, &ci, &co, &hw, &k)| {
                    ConvBuilder::forward(b, ci, co, [1, hw, hw], [1, k, k])
                        .pads([0, 0, k / 2, k / 2, k / 2, k / 2])
                        .build()
                })
                .collect::<Vec<_>>();
            let start_time = std::time::Instant::now();
            let failed = (0..*repeat)
                .flat_map(|_| grid.iter())
                .collect::<Vec<_>>()
                .into_par_iter()
                .filter(|request| orchestrator.plan(request).is_err())
                .count();
            info!("Sweep took {:?}", start_time.elapsed());
            report(orchestrator.cache(), orchestrator.stats(), grid.len() * repeat, failed);
        }
        Command::Targets => {
            catalog_table(PlatformBudget::catalog()).printstd();
        }
    }

    if args.record {
        repository.save().context("saving repository")?;
    }
    Ok(())
}

fn report(cache: &TilingCache, stats: &PlannerStats, planned: usize, failed: usize) {
    let c = cache.stats();
    println!("planned {} ({} failed)", planned, failed);
    println!(
        "cache: {} of {} entries, {} hits, {} misses, {} rejected",
        c.entries,
        cache.capacity(),
        c.hits,
        c.misses,
        c.rejections
    );
    println!(
        "searches: {}, kernel splits: {}, repository hits: {}",
        PlannerStats::get(&stats.searches),
        PlannerStats::get(&stats.kernel_split_escalations),
        PlannerStats::get(&stats.repository_hits)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(args: &[&str]) -> Result<ConvBuilder> {
        let args = Args::try_parse_from(
            ["convtile", "plan", "--ci", "16", "--co", "16"].iter().chain(args),
        )?;
        match args.command {
            Command::Plan { shape, .. } => shape.builder(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_input_is_required() {
        assert!(shape(&[]).is_err());
    }

    #[test]
    fn test_short_input_is_an_error() {
        assert!(shape(&["--input", "34,34"]).is_err());
        assert!(shape(&["--input", "34"]).is_err());
    }

    #[test]
    fn test_full_input_builds() {
        let request = shape(&["--input", "1,34,34"]).unwrap().build();
        assert_eq!(request.input.shape, [1, 16, 1, 34, 34]);
    }
}

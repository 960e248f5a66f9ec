use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};

use octans::htm::cover::{circle_cover, cover};
use octans::index::builder::{BuildConfig, PointRecord, build_files};
use octans::index::{Field, FieldKind, Tree};
use octans::region::{Circle, ConvexPolygon, Ellipse, Region};

#[derive(Parser)]
#[command(name = "octans", about = "HTM spatial search over astronomical catalogs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a point file and tree index from a text catalog.
    ///
    /// Each catalog line is `ra dec [value...]` in degrees; an optional
    /// leading `# name...` header names the extra columns.
    Build {
        /// Path to the text catalog.
        catalog: PathBuf,

        /// Output path for the point file.
        #[arg(short, long)]
        data: PathBuf,

        /// Output path for the tree index.
        #[arg(short = 'x', long)]
        index: PathBuf,

        /// Leaf threshold: nodes at or below this point count stay inline.
        #[arg(long, default_value = "64")]
        leafthresh: u64,

        /// Subdivision level of the index.
        #[arg(long, default_value = "20")]
        level: u32,
    },

    /// Count catalog entries inside a region.
    Count {
        /// Path to the point file.
        #[arg(short, long)]
        data: PathBuf,

        /// Path to the tree index (omit to force a linear scan).
        #[arg(short = 'x', long)]
        index: Option<PathBuf>,

        #[command(flatten)]
        region: RegionArgs,

        /// Test every point instead of walking the index.
        #[arg(long)]
        scan: bool,
    },

    /// Print the trixel-id ranges covering a region.
    Ids {
        #[command(flatten)]
        region: RegionArgs,

        /// Subdivision level of the enumeration.
        #[arg(long, default_value = "10")]
        level: u32,

        /// Cap on the number of ranges (coarsens adaptively).
        #[arg(long)]
        max_ranges: Option<usize>,
    },

    /// Print catalog and index facts.
    Info {
        /// Path to the point file.
        #[arg(short, long)]
        data: PathBuf,

        /// Path to the tree index.
        #[arg(short = 'x', long)]
        index: Option<PathBuf>,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct RegionArgs {
    /// Circle as "ra,dec,radius" in degrees.
    #[arg(long)]
    circle: Option<String>,

    /// Ellipse as "ra1,dec1,ra2,dec2,major" (two foci + semi-major axis).
    #[arg(long)]
    ellipse: Option<String>,

    /// Convex polygon as "ra,dec ra,dec ..." (three or more vertices).
    #[arg(long)]
    polygon: Option<String>,
}

fn parse_numbers(s: &str, expected: usize, what: &str) -> Vec<f64> {
    let parts: Vec<f64> = s
        .split(',')
        .map(|p| {
            p.trim().parse().unwrap_or_else(|_| {
                eprintln!("Invalid number '{}' in {what}", p.trim());
                process::exit(1);
            })
        })
        .collect();
    if parts.len() != expected {
        eprintln!("{what} needs {expected} comma-separated values, got {}", parts.len());
        process::exit(1);
    }
    parts
}

impl RegionArgs {
    fn build(&self) -> Box<dyn Region> {
        if let Some(arg) = &self.circle {
            let v = parse_numbers(arg, 3, "--circle");
            let center = octans::geom::sphere::radec_to_xyz(v[0].to_radians(), v[1].to_radians());
            return match Circle::new(center, v[2]) {
                Ok(c) => Box::new(c),
                Err(e) => {
                    eprintln!("Bad circle: {e}");
                    process::exit(1);
                }
            };
        }
        if let Some(arg) = &self.ellipse {
            let v = parse_numbers(arg, 5, "--ellipse");
            let f1 = octans::geom::sphere::radec_to_xyz(v[0].to_radians(), v[1].to_radians());
            let f2 = octans::geom::sphere::radec_to_xyz(v[2].to_radians(), v[3].to_radians());
            return match Ellipse::from_foci(f1, f2, v[4]) {
                Ok(e) => Box::new(e),
                Err(e) => {
                    eprintln!("Bad ellipse: {e}");
                    process::exit(1);
                }
            };
        }
        if let Some(arg) = &self.polygon {
            let coords: Vec<(f64, f64)> = arg
                .split_whitespace()
                .map(|pair| {
                    let v = parse_numbers(pair, 2, "--polygon vertex");
                    (v[0].to_radians(), v[1].to_radians())
                })
                .collect();
            return match ConvexPolygon::from_radec(&coords) {
                Ok(p) => Box::new(p),
                Err(e) => {
                    eprintln!("Bad polygon: {e}");
                    process::exit(1);
                }
            };
        }
        unreachable!("clap enforces exactly one region");
    }

    fn as_circle(&self) -> Option<Circle> {
        self.circle.as_ref().map(|arg| {
            let v = parse_numbers(arg, 3, "--circle");
            let center = octans::geom::sphere::radec_to_xyz(v[0].to_radians(), v[1].to_radians());
            Circle::new(center, v[2]).unwrap_or_else(|e| {
                eprintln!("Bad circle: {e}");
                process::exit(1);
            })
        })
    }
}

/// Parse a text catalog: `ra dec [value...]` per line, degrees, `#`-comments.
/// A first comment line naming columns becomes the payload schema.
fn read_catalog(path: &Path) -> (Vec<PointRecord>, Vec<Field>) {
    let text = fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Failed to read catalog {}: {e}", path.display());
        process::exit(1);
    });

    let mut fields: Option<Vec<Field>> = None;
    let mut points = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_prefix('#') {
            if fields.is_none() && points.is_empty() {
                let names: Vec<Field> = header
                    .split_whitespace()
                    .map(|name| Field {
                        name: name.to_string(),
                        kind: FieldKind::Float64,
                    })
                    .collect();
                if !names.is_empty() {
                    fields = Some(names);
                }
            }
            continue;
        }
        let nums: Vec<f64> = line
            .split_whitespace()
            .map(|tok| {
                tok.parse().unwrap_or_else(|_| {
                    eprintln!("Line {}: invalid number '{tok}'", lineno + 1);
                    process::exit(1);
                })
            })
            .collect();
        if nums.len() < 2 {
            eprintln!("Line {}: need at least ra and dec", lineno + 1);
            process::exit(1);
        }
        points.push(PointRecord {
            position: octans::geom::sphere::radec_to_xyz(
                nums[0].to_radians(),
                nums[1].to_radians(),
            ),
            values: nums[2..].to_vec(),
        });
    }

    let fields = fields.unwrap_or_else(|| {
        let n = points.first().map_or(0, |p| p.values.len());
        (0..n)
            .map(|i| Field {
                name: format!("col{}", i + 3),
                kind: FieldKind::Float64,
            })
            .collect()
    });
    for (i, p) in points.iter().enumerate() {
        if p.values.len() != fields.len() {
            eprintln!(
                "Point {} has {} extra columns, expected {}",
                i + 1,
                p.values.len(),
                fields.len()
            );
            process::exit(1);
        }
    }
    (points, fields)
}

fn cmd_build(catalog: &Path, data: &Path, index: &Path, leafthresh: u64, level: u32) {
    let (points, fields) = read_catalog(catalog);
    eprintln!("Read {} points, {} payload columns", points.len(), fields.len());

    let config = BuildConfig {
        leafthresh,
        level,
        progress: true,
    };
    let t0 = Instant::now();
    let stats = build_files(&points, &fields, data, index, &config).unwrap_or_else(|e| {
        eprintln!("Build failed: {e}");
        process::exit(1);
    });
    eprintln!(
        "Indexed {} points in {:.1}s (leafthresh {}, {} data bytes, {} index bytes)",
        stats.count,
        t0.elapsed().as_secs_f64(),
        stats.leafthresh,
        stats.data_bytes,
        stats.index_bytes
    );
}

fn cmd_count(data: &Path, index: Option<&Path>, region_args: &RegionArgs, scan: bool) {
    let tree = Tree::open(data, index).unwrap_or_else(|e| {
        eprintln!("Failed to open catalog: {e}");
        process::exit(1);
    });
    let region = region_args.build();
    let t0 = Instant::now();
    let count = if scan {
        tree.scan_count(region.as_ref())
    } else {
        tree.tree_count(region.as_ref()).unwrap_or_else(|e| {
            eprintln!("Query failed: {e}");
            process::exit(1);
        })
    };
    eprintln!(
        "{} of {} entries in {:.3}ms",
        count,
        tree.count(),
        t0.elapsed().as_secs_f64() * 1e3
    );
    println!("{count}");
}

fn cmd_ids(region_args: &RegionArgs, level: u32, max_ranges: Option<usize>) {
    let cap = max_ranges.unwrap_or(usize::MAX);
    // The circle path knows the degenerate radii shortcuts.
    let result = if let Some(circle) = region_args.as_circle() {
        circle_cover(&circle, level, cap)
    } else {
        cover(region_args.build().as_ref(), level, cap)
    };
    let ranges = result.unwrap_or_else(|e| {
        eprintln!("Enumeration failed: {e}");
        process::exit(1);
    });
    eprintln!("{} range(s) at level {level}", ranges.len());
    for r in &ranges {
        println!("{} {}", r.lo, r.hi);
    }
}

fn cmd_info(data: &Path, index: Option<&Path>) {
    let tree = Tree::open(data, index).unwrap_or_else(|e| {
        eprintln!("Failed to open catalog: {e}");
        process::exit(1);
    });
    println!("entries:    {}", tree.count());
    println!("indexed:    {}", tree.has_index());
    if tree.has_index() {
        println!("leafthresh: {}", tree.leafthresh());
    }
    if tree.fields().is_empty() {
        println!("payload:    none");
    } else {
        let names: Vec<&str> = tree.fields().iter().map(|f| f.name.as_str()).collect();
        println!("payload:    {}", names.join(", "));
    }
}

fn main() {
    let cli = Cli::parse();
    match &cli.command {
        Commands::Build {
            catalog,
            data,
            index,
            leafthresh,
            level,
        } => cmd_build(catalog, data, index, *leafthresh, *level),
        Commands::Count {
            data,
            index,
            region,
            scan,
        } => cmd_count(data, index.as_deref(), region, *scan),
        Commands::Ids {
            region,
            level,
            max_ranges,
        } => cmd_ids(region, *level, *max_ranges),
        Commands::Info { data, index } => cmd_info(data, index.as_deref()),
    }
}

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use rasterflow::{
    Buffer, BufferHandle, Category, CategoryMask, ContextOpts, ListParams, Optimizer,
    OptimizerDescriptor, OptimizerParams, QueueOpts, RectI, RenderContext, RenderOpts, RunParams,
    TaskContext, TaskGraph, TaskId, TaskKind, TaskNode,
};
use serde_json::json;

#[derive(Clone, Debug)]
struct BenchArgs {
    width: u32,
    height: u32,
    tile: u32,
    overlap: u32,
    work: u32,
    warmup: u32,
    repeats: u32,
    threads: Option<usize>,
    queue_json: Option<String>,
    json: bool,
}

#[derive(Clone, Debug, Default)]
struct RunMetrics {
    build: Duration,
    optimize: Duration,
    run_total: Duration,
    tasks: usize,
    edges: usize,
}

/// Plain pixel-less surface; tiles only need an identity and a size.
struct Plane {
    width: u32,
    height: u32,
}

impl Buffer for Plane {
    fn name(&self) -> &str {
        "plane"
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }
}

/// Burns `work` iterations per pixel row of its rectangle.
struct Tile {
    work: u32,
    empty: bool,
}

impl TaskKind for Tile {
    fn name(&self) -> &str {
        if self.empty { "tile-empty" } else { "tile" }
    }

    fn run(&self, ctx: &TaskContext<'_>) -> bool {
        let rows = ctx.node().target_rect.height();
        let mut acc = 0u64;
        for i in 0..u64::from(rows) * u64::from(self.work) {
            acc = acc.wrapping_mul(6364136223846793005).wrapping_add(i);
        }
        std::hint::black_box(acc);
        true
    }
}

struct Composite;

impl TaskKind for Composite {
    fn name(&self) -> &str {
        "composite"
    }

    fn run(&self, ctx: &TaskContext<'_>) -> bool {
        ctx.upstream_ok
    }
}

struct DropEmptyTiles;

impl Optimizer for DropEmptyTiles {
    fn name(&self) -> &str {
        "drop-empty-tiles"
    }

    fn descriptor(&self) -> OptimizerDescriptor {
        OptimizerDescriptor::new(Category::Common).for_task()
    }

    fn run_task(&self, params: &mut OptimizerParams<'_>) {
        if params.node().map(TaskNode::name) == Some("tile-empty") {
            params.replace(None, CategoryMask::empty());
        }
    }
}

struct Linearize;

fn hoist(
    graph: &TaskGraph,
    task: TaskId,
    seen: &mut HashSet<TaskId>,
    out: &mut Vec<Option<TaskId>>,
) {
    for &sub in graph[task].sub_tasks.iter().flatten() {
        hoist(graph, sub, seen, out);
    }
    if seen.insert(task) {
        out.push(Some(task));
    }
}

impl Optimizer for Linearize {
    fn name(&self) -> &str {
        "linearize"
    }

    fn descriptor(&self) -> OptimizerDescriptor {
        OptimizerDescriptor::new(Category::Linear).for_list()
    }

    fn run_list(&self, params: &mut ListParams<'_>) {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(params.list.len());
        for &task in params.list.iter().flatten() {
            hoist(params.graph, task, &mut seen, &mut out);
        }
        *params.list = out;
    }
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn try_main() -> anyhow::Result<()> {
    let args = parse_args()?;

    if args.width == 0 || args.height == 0 {
        anyhow::bail!("--width/--height must be > 0");
    }
    if args.tile == 0 {
        anyhow::bail!("--tile must be > 0");
    }

    let mut queue = match &args.queue_json {
        Some(raw) => QueueOpts::from_json_str(raw).context("parse --queue-json")?,
        None => QueueOpts::default(),
    };
    if args.threads.is_some() {
        queue.threads = args.threads;
    }

    let mut ctx = RenderContext::new(&ContextOpts { queue }).context("start render context")?;
    let renderer = Arc::new(ctx.create_renderer(RenderOpts::default()));
    renderer.register_optimizer(Arc::new(DropEmptyTiles))?;
    renderer.register_optimizer(Arc::new(Linearize))?;
    ctx.register_renderer("bench", Arc::clone(&renderer))?;

    eprintln!(
        "bench: {repeats} run(s) ({profile} build), {w}x{h} tiles of {tile}px, overlap={overlap}, work={work}, threads={threads}",
        repeats = args.repeats,
        profile = if cfg!(debug_assertions) {
            "debug"
        } else {
            "release"
        },
        w = args.width,
        h = args.height,
        tile = args.tile,
        overlap = args.overlap,
        work = args.work,
        threads = ctx.queue().thread_count(),
    );

    if args.warmup > 0 {
        eprintln!("warmup: {} run(s)", args.warmup);
        for _ in 0..args.warmup {
            let _ = run_once(&args, &renderer)?;
        }
    }

    let mut runs = Vec::<RunMetrics>::with_capacity(args.repeats as usize);
    for _ in 0..args.repeats {
        runs.push(run_once(&args, &renderer)?);
    }

    report_percentiles(&runs, args.json);
    Ok(())
}

/// One frame: a grid of tiles grouped under one composite per tile row, every seventh tile
/// empty. Neighbouring tiles overlap by `overlap` pixels.
fn build_frame(args: &BenchArgs) -> (TaskGraph, Vec<TaskId>) {
    let layer = BufferHandle::new(Plane {
        width: args.width,
        height: args.height,
    });
    let canvas = BufferHandle::new(Plane {
        width: args.width,
        height: args.height,
    });

    let mut graph = TaskGraph::new();
    let mut roots = Vec::new();
    let mut n = 0u32;
    for y in (0..args.height).step_by(args.tile as usize) {
        let y1 = (y + args.tile).min(args.height);
        let mut row = Vec::new();
        for x in (0..args.width).step_by(args.tile as usize) {
            let x1 = (x + args.tile + args.overlap).min(args.width);
            let rect = RectI::new(x as i32, y as i32, x1 as i32, y1 as i32);
            let tile = Tile {
                work: args.work,
                empty: n % 7 == 6,
            };
            n += 1;
            row.push(graph.insert(TaskNode::new(tile).with_target(layer.clone(), rect)));
        }
        let rect = RectI::new(0, y as i32, args.width as i32, y1 as i32);
        roots.push(
            graph.insert(
                TaskNode::new(Composite)
                    .with_target(canvas.clone(), rect)
                    .with_sub_tasks(row),
            ),
        );
    }
    (graph, roots)
}

fn run_once(args: &BenchArgs, renderer: &rasterflow::Renderer) -> anyhow::Result<RunMetrics> {
    let mut m = RunMetrics::default();

    let t0 = Instant::now();
    let (graph, roots) = build_frame(args);
    m.build = t0.elapsed();

    let t0 = Instant::now();
    let mut scratch = graph.clone();
    let mut list: Vec<Option<TaskId>> = roots.iter().copied().map(Some).collect();
    renderer.optimize(&mut scratch, &mut list)?;
    m.optimize = t0.elapsed();

    let t0 = Instant::now();
    let report = renderer.run_with_report(&graph, &roots, RunParams::default())?;
    m.run_total = t0.elapsed();
    if !report.success {
        anyhow::bail!("bench frame reported failed tasks");
    }
    m.tasks = report.optimized_tasks;
    m.edges = report.dependency_edges;

    Ok(m)
}

fn parse_args() -> anyhow::Result<BenchArgs> {
    let mut args = std::env::args().skip(1);

    let mut out = BenchArgs {
        width: 1920,
        height: 1080,
        tile: 64,
        overlap: 2,
        work: 200,
        warmup: 2,
        repeats: 50,
        threads: None,
        queue_json: None,
        json: false,
    };

    while let Some(a) = args.next() {
        match a.as_str() {
            "--width" => out.width = parse_u32(args.next(), "--width")?,
            "--height" => out.height = parse_u32(args.next(), "--height")?,
            "--tile" => out.tile = parse_u32(args.next(), "--tile")?,
            "--overlap" => out.overlap = parse_u32(args.next(), "--overlap")?,
            "--work" => out.work = parse_u32(args.next(), "--work")?,
            "--warmup" => out.warmup = parse_u32(args.next(), "--warmup")?,
            "--repeats" => out.repeats = parse_u32(args.next(), "--repeats")?,
            "--threads" => out.threads = Some(parse_usize(args.next(), "--threads")?),
            "--queue-json" => {
                out.queue_json = Some(args.next().ok_or_else(|| {
                    anyhow::anyhow!("missing value for --queue-json (expected a JSON object)")
                })?)
            }
            "--json" => out.json = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => anyhow::bail!("unknown arg '{a}' (try --help)"),
        }
    }

    Ok(out)
}

fn print_help() {
    eprintln!(
        r#"rasterflow-bench

Schedules a synthetic tiled frame repeatedly and reports p50/p90/p99 for each stage.

Usage:
  cargo run -q --release
  cargo run -q --release -- --repeats 100 --tile 32
  cargo run -q --release -- --threads 4 --json

Args:
  --width N        (default 1920)
  --height N       (default 1080)
  --tile N         tile edge in pixels (default 64)
  --overlap N      horizontal overlap between neighbouring tiles (default 2)
  --work N         busy-loop iterations per tile row (default 200)
  --warmup N       (default 2)
  --repeats N      (default 50)
  --threads N      worker threads (default auto)
  --queue-json S   queue options as JSON, e.g. '{{"dedicated_lane": false}}'
  --json           print the percentile summary as JSON on stdout
"#
    );
}

fn parse_u32(v: Option<String>, flag: &str) -> anyhow::Result<u32> {
    let v = v.ok_or_else(|| anyhow::anyhow!("missing value for {flag}"))?;
    v.parse::<u32>()
        .with_context(|| format!("parse {flag} value '{v}'"))
}

fn parse_usize(v: Option<String>, flag: &str) -> anyhow::Result<usize> {
    let v = v.ok_or_else(|| anyhow::anyhow!("missing value for {flag}"))?;
    v.parse::<usize>()
        .with_context(|| format!("parse {flag} value '{v}'"))
}

fn report_percentiles(runs: &[RunMetrics], as_json: bool) {
    type Getter = fn(&RunMetrics) -> Duration;
    type Field = (&'static str, Getter);

    fn collect(runs: &[RunMetrics], f: Getter) -> Vec<Duration> {
        let mut v = runs.iter().map(f).collect::<Vec<_>>();
        v.sort_by_key(|d| d.as_nanos());
        v
    }

    fn p(v: &[Duration], p: f64) -> Duration {
        if v.is_empty() {
            return Duration::ZERO;
        }
        let n = v.len();
        let rank = (p * (n as f64)).ceil().clamp(1.0, n as f64) as usize;
        v[rank - 1]
    }

    fn ms(d: Duration) -> f64 {
        d.as_secs_f64() * 1000.0
    }

    let fields: &[Field] = &[
        ("build", |m| m.build),
        ("optimize", |m| m.optimize),
        ("run_total", |m| m.run_total),
    ];

    let (tasks, edges) = runs.last().map_or((0, 0), |m| (m.tasks, m.edges));
    eprintln!("\nscheduled {tasks} task(s), {edges} dependency edge(s) per frame");
    eprintln!("percentiles across runs (p50/p90/p99):");

    let mut summary = serde_json::Map::new();
    for (name, getter) in fields {
        let v = collect(runs, *getter);
        let (p50, p90, p99) = (p(&v, 0.50), p(&v, 0.90), p(&v, 0.99));
        eprintln!(
            "  {name:10} p50={p50:>10.3}ms  p90={p90:>10.3}ms  p99={p99:>10.3}ms",
            name = *name,
            p50 = ms(p50),
            p90 = ms(p90),
            p99 = ms(p99)
        );
        summary.insert(
            (*name).to_string(),
            json!({ "p50_ms": ms(p50), "p90_ms": ms(p90), "p99_ms": ms(p99) }),
        );
    }

    if as_json {
        let doc = json!({
            "runs": runs.len(),
            "tasks": tasks,
            "edges": edges,
            "stages": summary,
        });
        println!("{doc}");
    }
}

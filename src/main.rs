use clap::{Parser, ValueEnum};
use log::{error, info, warn};

use lodestone::{
    linear_system::iterative::{DEFAULT_CG_TOLERANCE, DEFAULT_MAX_CG_ITER},
    mesher::{self, MeshKind, Problem},
    post_processor::{self, QueryResult},
    ConjugateGradientSystem, FemError, MfcStrategy, Solver,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Dense Cholesky/LU factorization
    Dense,
    /// Sparse conjugate gradient (symmetric positive definite systems only)
    Cg,
}

/// Linear finite element solver
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Problem description json
    input: String,

    /// Linear system backend
    #[arg(short, long, value_enum, default_value_t = Backend::Dense)]
    backend: Backend,

    /// Output csv of node positions and displacements
    #[arg(long, default_value = "nodes.csv")]
    nodes_output: String,

    /// Output csv of query point lookups
    #[arg(long, default_value = "queries.csv")]
    queries_output: String,

    /// Relative residual at which conjugate gradient stops
    #[arg(long, default_value_t = DEFAULT_CG_TOLERANCE)]
    tolerance: f64,

    /// Conjugate gradient iteration limit
    #[arg(long, default_value_t = DEFAULT_MAX_CG_ITER)]
    max_iterations: u64,
}

fn solve_problem<const D: usize>(problem: Problem<D>, args: &Args) -> Result<(), FemError> {
    let Problem {
        mut mesh,
        mut config,
        grid,
        queries,
    } = problem;
    config.show_progress = true;

    if args.backend == Backend::Cg
        && !mesh.constraints.is_empty()
        && config.mfc_strategy == MfcStrategy::LagrangeMultiplier
    {
        warn!("conjugate gradient needs a positive definite system, using penalty constraints");
        config.mfc_strategy = MfcStrategy::Penalty {
            scale: mesher::DEFAULT_PENALTY_SCALE,
        };
    }

    let mut cg = ConjugateGradientSystem::new(args.tolerance, args.max_iterations).with_progress(true);
    let results = {
        let mut solver = match args.backend {
            Backend::Dense => Solver::new(&mut mesh, config),
            Backend::Cg => Solver::with_backend(&mut mesh, &mut cg, config),
        };
        info!("using {} backend", solver.linear_system().name());

        if let Some(geometry) = grid {
            solver.initialize_interpolation_grid(geometry)?;
        }
        solver.solve()?;

        for set in 0..solver.config().solution_sets {
            info!(
                "deformation energy of solution set {}: {:e}",
                set,
                solver.deformation_energy(set)?
            );
        }

        let mut results = Vec::new();
        for point in queries {
            results.push(QueryResult {
                point,
                element: solver.element_at_point(&point)?,
                displacement: solver.interpolate_displacement(&point)?,
            });
        }
        results
    };

    post_processor::csv_output(&mesh, &args.nodes_output)?;
    if !results.is_empty() {
        post_processor::query_output(&results, &args.queries_output)?;
    }

    Ok(())
}

fn run(args: &Args) -> Result<(), FemError> {
    let input_json = mesher::load_input_file(&args.input)?;

    match mesher::mesh_kind(&input_json)? {
        MeshKind::Bar => solve_problem(mesher::build_bar_problem(&input_json)?, args),
        MeshKind::Rectangle => solve_problem(mesher::build_rectangle_problem(&input_json)?, args),
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if let Err(err) = run(&args) {
        error!("{err}");
        std::process::exit(1)
    }
}

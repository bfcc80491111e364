//! SOCP bisection demo: max-min SINR bound for a random cell-free layout.
//!
//! Draws a random channel-inverse matrix for 8 APs serving 4 UEs, drops a
//! quarter of the UE-AP links, and bisects on the SINR target with the SOCP
//! feasibility solver.
//!
//! Run:
//! ```sh
//! RUST_LOG=debug cargo run --example socp_bisection_demo
//! ```

use aps_mappo::aps::{
    bisect_max_min_sinr, min_sinr, sinr_from_a, BeamformingProblem, Complex64,
    SocpConstraintSolver, SolverSettings,
};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

const N_APS: usize = 8;
const N_UES: usize = 4;
const RHO_D: f64 = 10.0;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== SOCP Max-Min SINR Bisection Demo ===\n");

    let mut rng = StdRng::seed_from_u64(7);
    let g_dague = Array2::from_shape_fn((N_APS, N_UES), |_| {
        Complex64::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0))
    });
    let p_g = Array2::from_elem((N_APS, N_APS), Complex64::new(0.0, 0.0));
    let mask = Array2::from_shape_fn((N_APS, N_UES), |_| rng.gen_bool(0.75));

    println!("Layout:");
    println!("  APs: {N_APS}, UEs: {N_UES}, rho_d: {RHO_D}");
    println!(
        "  Active links: {}/{}",
        mask.iter().filter(|&&m| m).count(),
        mask.len()
    );
    println!();

    let problem = match BeamformingProblem::new(
        g_dague.view(),
        p_g.view(),
        RHO_D,
        N_APS,
        N_UES,
        Some(mask.view()),
    ) {
        Ok(problem) => problem,
        Err(e) => {
            eprintln!("invalid problem: {e}");
            return;
        }
    };

    let solver = SocpConstraintSolver::new(SolverSettings::default());
    let bound = match bisect_max_min_sinr(&solver, &problem, 0.0, 100.0, 1e-3, 60) {
        Ok(bound) => bound,
        Err(e) => {
            eprintln!("bisection failed: {e}");
            return;
        }
    };

    println!("Bisection:");
    println!("  Solver calls: {}", bound.solver_calls);
    println!("  Max-min SINR bound: {:.4}", bound.t);

    match &bound.solution {
        Some(solution) => {
            println!("  Last feasible solve: {:?}", solution.solve_time);
            println!("  Achieved min SINR: {:.4}", min_sinr(solution.a.view(), RHO_D));
            for (ue, sinr) in sinr_from_a(solution.a.view(), RHO_D).iter().enumerate() {
                println!("    UE {ue}: {sinr:.4}");
            }
        }
        None => println!("  No feasible target found in the bracket"),
    }
}

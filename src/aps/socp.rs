//! Second-order cone feasibility problem for max-min SINR precoding.
//!
//! For a target SINR `t`, the problem asks whether a combining matrix `A`
//! and a null-space component `U` exist such that
//!
//! - `A_diag[i] ≥ √t · ‖Ã[i, :]‖₂` for every UE (the SINR cone),
//! - `‖Δ[m, :]‖₂ ≤ 1` for every AP, with `Δ = G† A + P_G U`,
//! - `Δ[m, k] = 0` wherever the connectivity mask forbids the link.
//!
//! `Ã` is the `K × (K + 1)` helper whose diagonal is zero, whose off-diagonal
//! entries equal those of `A`, and whose last column is pinned to `1/√ρ_d`.
//! Its pinned entries are constants, so the real-valued program only carries
//! the off-diagonal entries of `A`, the real diagonal `A_diag`, and `U`.
//!
//! Complex variables are split into real and imaginary parts and the program
//! is handed to Clarabel in standard conic form `A x + s = b, s ∈ K`.

use std::time::Duration;

use clarabel::algebra::CscMatrix;
use clarabel::solver::{DefaultSettings, DefaultSolver, IPSolver, SolverStatus, SupportedConeT};
use ndarray::{Array1, Array2, ArrayView2};
use tracing::debug;

use super::error::SocpError;
use super::Complex64;

/// Outcome of one feasibility solve.
#[derive(Debug, Clone, PartialEq)]
pub enum SolveStatus {
    /// A point satisfying every constraint was found.
    Optimal,
    /// The constraints cannot be satisfied for this target.
    Infeasible,
    /// The backend stopped without a certificate either way.
    SolverError(String),
}

impl SolveStatus {
    pub fn is_feasible(&self) -> bool {
        matches!(self, SolveStatus::Optimal)
    }

    fn from_backend(status: SolverStatus) -> Self {
        match status {
            SolverStatus::Solved | SolverStatus::AlmostSolved => SolveStatus::Optimal,
            SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible => {
                SolveStatus::Infeasible
            }
            other => SolveStatus::SolverError(format!("{other:?}")),
        }
    }
}

/// Backend tolerances and limits.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SolverSettings {
    pub max_iter: u32,
    pub tol_feas: f64,
    pub tol_gap_abs: f64,
    pub tol_gap_rel: f64,
    pub verbose: bool,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iter: 200,
            tol_feas: 1e-8,
            tol_gap_abs: 1e-8,
            tol_gap_rel: 1e-8,
            verbose: false,
        }
    }
}

/// Channel data fixing the constraint set of the SOCP.
///
/// * `g_dague` - `M × K` channel pseudo-inverse `G†`
/// * `p_g` - `M × M` projection onto the orthogonal complement of the channel
/// * `rho_d` - normalized downlink power budget
/// * `mask` - optional `M × K` connectivity mask (`false` forbids the link)
#[derive(Debug, Clone)]
pub struct BeamformingProblem<'a> {
    pub g_dague: ArrayView2<'a, Complex64>,
    pub p_g: ArrayView2<'a, Complex64>,
    pub rho_d: f64,
    pub mask: Option<ArrayView2<'a, bool>>,
}

impl<'a> BeamformingProblem<'a> {
    /// Checks shapes against the declared AP count `m` and UE count `k`.
    pub fn new(
        g_dague: ArrayView2<'a, Complex64>,
        p_g: ArrayView2<'a, Complex64>,
        rho_d: f64,
        m: usize,
        k: usize,
        mask: Option<ArrayView2<'a, bool>>,
    ) -> Result<Self, SocpError> {
        if g_dague.dim() != (m, k) {
            return Err(SocpError::DimensionMismatch {
                what: "G_dague",
                expected: (m, k),
                found: g_dague.dim(),
            });
        }
        if p_g.dim() != (m, m) {
            return Err(SocpError::DimensionMismatch {
                what: "P_G",
                expected: (m, m),
                found: p_g.dim(),
            });
        }
        if let Some(mask) = &mask {
            if mask.dim() != (m, k) {
                return Err(SocpError::DimensionMismatch {
                    what: "mask",
                    expected: (m, k),
                    found: mask.dim(),
                });
            }
        }
        if !(rho_d.is_finite() && rho_d > 0.0) {
            return Err(SocpError::InvalidPowerBudget(rho_d));
        }
        Ok(Self {
            g_dague,
            p_g,
            rho_d,
            mask,
        })
    }

    /// Number of APs `M`.
    pub fn n_aps(&self) -> usize {
        self.g_dague.nrows()
    }

    /// Number of UEs `K`.
    pub fn n_ues(&self) -> usize {
        self.g_dague.ncols()
    }

    fn link_allowed(&self, m: usize, k: usize) -> bool {
        self.mask.as_ref().map_or(true, |mask| mask[[m, k]])
    }
}

/// Decision variables recovered from a solve, plus backend diagnostics.
///
/// Variable values are only meaningful when `status` is
/// [`SolveStatus::Optimal`].
#[derive(Debug, Clone)]
pub struct SocpSolution {
    pub status: SolveStatus,
    /// `K × K` combining matrix, diagonal equal to `a_diag`.
    pub a: Array2<Complex64>,
    /// Real diagonal magnitudes of `a`.
    pub a_diag: Array1<f64>,
    /// `K × (K + 1)` helper matrix.
    pub a_tilde: Array2<Complex64>,
    /// `M × K` null-space component.
    pub u: Array2<Complex64>,
    pub iterations: u32,
    pub solve_time: Duration,
}

/// Column layout of the real-valued decision vector.
struct VariableLayout {
    k: usize,
    m: usize,
}

impl VariableLayout {
    fn n_off(&self) -> usize {
        2 * self.k * self.k.saturating_sub(1)
    }

    fn len(&self) -> usize {
        self.n_off() + self.k + 2 * self.m * self.k
    }

    /// Real-part column of `A[i, j]`, `i != j`; the imaginary part follows.
    fn off(&self, i: usize, j: usize) -> usize {
        debug_assert_ne!(i, j);
        let slot = i * (self.k - 1) + if j < i { j } else { j - 1 };
        2 * slot
    }

    fn diag(&self, i: usize) -> usize {
        self.n_off() + i
    }

    /// Real-part column of `U[l, k]`; the imaginary part follows.
    fn u(&self, l: usize, k: usize) -> usize {
        self.n_off() + self.k + 2 * (l * self.k + k)
    }
}

/// Real and imaginary parts of a complex affine form in the decision vector.
#[derive(Default)]
struct ComplexForm {
    re: Vec<(usize, f64)>,
    im: Vec<(usize, f64)>,
}

impl ComplexForm {
    /// Adds `g · z` where `z = x[col] + i·x[col + 1]`.
    fn add_complex(&mut self, g: Complex64, col: usize) {
        self.re.push((col, g.re));
        self.re.push((col + 1, -g.im));
        self.im.push((col, g.im));
        self.im.push((col + 1, g.re));
    }

    /// Adds `g · x[col]` for a real variable.
    fn add_real(&mut self, g: Complex64, col: usize) {
        self.re.push((col, g.re));
        self.im.push((col, g.im));
    }
}

/// Accumulates `A x + s = b` rows together with their cone list.
struct ConicBuilder {
    triplets: Vec<(usize, usize, f64)>,
    b: Vec<f64>,
    cones: Vec<SupportedConeT<f64>>,
}

impl ConicBuilder {
    fn new() -> Self {
        Self {
            triplets: Vec::new(),
            b: Vec::new(),
            cones: Vec::new(),
        }
    }

    /// Appends the row `s = b - a·x`.
    fn row(&mut self, a: &[(usize, f64)], b: f64) {
        let r = self.b.len();
        self.triplets
            .extend(a.iter().filter(|(_, v)| *v != 0.0).map(|&(c, v)| (r, c, v)));
        self.b.push(b);
    }

    /// Appends the row `s = coeff · x[col] + b`.
    fn row_with(&mut self, col: usize, coeff: f64, b: f64) {
        self.row(&[(col, -coeff)], b);
    }

    /// Appends the row `s = form` (negated coefficients in `A`).
    fn row_equal_to(&mut self, form: &[(usize, f64)]) {
        let negated: Vec<_> = form.iter().map(|&(c, v)| (c, -v)).collect();
        self.row(&negated, 0.0);
    }

    fn constant_row(&mut self, b: f64) {
        self.row(&[], b);
    }

    fn n_rows(&self) -> usize {
        self.b.len()
    }

    fn into_csc(mut self, n_cols: usize) -> (CscMatrix<f64>, Vec<f64>, Vec<SupportedConeT<f64>>) {
        let n_rows = self.b.len();
        self.triplets.sort_by_key(|&(r, c, _)| (c, r));

        let mut colptr = vec![0usize; n_cols + 1];
        let mut rowval = Vec::with_capacity(self.triplets.len());
        let mut nzval: Vec<f64> = Vec::with_capacity(self.triplets.len());
        let mut last: Option<(usize, usize)> = None;

        for (r, c, v) in self.triplets {
            if last == Some((r, c)) {
                if let Some(tail) = nzval.last_mut() {
                    *tail += v;
                }
                continue;
            }
            rowval.push(r);
            nzval.push(v);
            colptr[c + 1] += 1;
            last = Some((r, c));
        }
        for c in 0..n_cols {
            colptr[c + 1] += colptr[c];
        }

        (
            CscMatrix::new(n_rows, n_cols, colptr, rowval, nzval),
            self.b,
            self.cones,
        )
    }
}

/// Solves the per-step SOCP feasibility problem.
///
/// Each call builds a fresh problem, solves it once, and discards the backend
/// state. Infeasibility is reported through [`SocpSolution::status`].
#[derive(Debug, Clone, Default)]
pub struct SocpConstraintSolver {
    pub settings: SolverSettings,
}

impl SocpConstraintSolver {
    pub fn new(settings: SolverSettings) -> Self {
        Self { settings }
    }

    /// Decides whether the SINR lower bound `t` is achievable for `problem`.
    pub fn solve(
        &self,
        t: f64,
        problem: &BeamformingProblem<'_>,
    ) -> Result<SocpSolution, SocpError> {
        if !(t.is_finite() && t >= 0.0) {
            return Err(SocpError::InvalidTarget(t));
        }

        let m = problem.n_aps();
        let k = problem.n_ues();
        let layout = VariableLayout { k, m };
        let n = layout.len();
        let sqrt_t = t.sqrt();
        let anchor = 1.0 / problem.rho_d.sqrt();

        // Δ[m, k] = Σ_j G†[m, j] A[j, k] + Σ_l P_G[m, l] U[l, k]
        let delta: Vec<Vec<ComplexForm>> = (0..m)
            .map(|ap| {
                (0..k)
                    .map(|ue| {
                        let mut form = ComplexForm::default();
                        for j in 0..k {
                            let g = problem.g_dague[[ap, j]];
                            if j == ue {
                                form.add_real(g, layout.diag(ue));
                            } else {
                                form.add_complex(g, layout.off(j, ue));
                            }
                        }
                        for l in 0..m {
                            form.add_complex(problem.p_g[[ap, l]], layout.u(l, ue));
                        }
                        form
                    })
                    .collect()
            })
            .collect();

        let mut builder = ConicBuilder::new();

        // masked links: Δ[m, k] = 0
        let start = builder.n_rows();
        for (ap, row) in delta.iter().enumerate() {
            for (ue, form) in row.iter().enumerate() {
                if !problem.link_allowed(ap, ue) {
                    builder.row_equal_to(&form.re);
                    builder.row_equal_to(&form.im);
                }
            }
        }
        let masked_rows = builder.n_rows() - start;
        if masked_rows > 0 {
            builder.cones.push(SupportedConeT::ZeroConeT(masked_rows));
        }

        // A_diag ≥ 0
        for i in 0..k {
            builder.row_with(layout.diag(i), 1.0, 0.0);
        }
        if k > 0 {
            builder.cones.push(SupportedConeT::NonnegativeConeT(k));
        }

        // (A_diag[i], √t · Ã[i, :]) ∈ SOC
        for i in 0..k {
            builder.row_with(layout.diag(i), 1.0, 0.0);
            for j in (0..k).filter(|&j| j != i) {
                let col = layout.off(i, j);
                builder.row_with(col, sqrt_t, 0.0);
                builder.row_with(col + 1, sqrt_t, 0.0);
            }
            builder.constant_row(sqrt_t * anchor);
            builder.cones.push(SupportedConeT::SecondOrderConeT(2 * k));
        }

        // (1, Δ[m, :]) ∈ SOC
        for row in &delta {
            builder.constant_row(1.0);
            for form in row {
                builder.row_equal_to(&form.re);
                builder.row_equal_to(&form.im);
            }
            builder.cones.push(SupportedConeT::SecondOrderConeT(1 + 2 * k));
        }

        let (a_mat, b, cones) = builder.into_csc(n);
        let p = CscMatrix::new(n, n, vec![0; n + 1], Vec::new(), Vec::new());
        let q = vec![0.0; n];

        let mut settings = DefaultSettings::<f64>::default();
        settings.verbose = self.settings.verbose;
        settings.max_iter = self.settings.max_iter;
        settings.tol_feas = self.settings.tol_feas;
        settings.tol_gap_abs = self.settings.tol_gap_abs;
        settings.tol_gap_rel = self.settings.tol_gap_rel;

        let mut solver = DefaultSolver::new(&p, &q, &a_mat, &b, &cones, settings);
        solver.solve();

        let status = SolveStatus::from_backend(solver.solution.status);
        let solve_time = Duration::from_secs_f64(solver.solution.solve_time.max(0.0));
        let iterations = solver.solution.iterations;
        debug!(
            t,
            n_aps = m,
            n_ues = k,
            masked_rows,
            ?status,
            iterations,
            "SOCP solve finished in {:?}",
            solve_time
        );

        Ok(recover_solution(
            &solver.solution.x,
            &layout,
            anchor,
            status,
            iterations,
            solve_time,
        ))
    }
}

fn recover_solution(
    x: &[f64],
    layout: &VariableLayout,
    anchor: f64,
    status: SolveStatus,
    iterations: u32,
    solve_time: Duration,
) -> SocpSolution {
    let (k, m) = (layout.k, layout.m);
    let value = |col: usize| x.get(col).copied().unwrap_or(0.0);
    let complex = |col: usize| Complex64::new(value(col), value(col + 1));

    let a_diag = Array1::from_shape_fn(k, |i| value(layout.diag(i)));
    let a = Array2::from_shape_fn((k, k), |(i, j)| {
        if i == j {
            Complex64::new(a_diag[i], 0.0)
        } else {
            complex(layout.off(i, j))
        }
    });
    let a_tilde = Array2::from_shape_fn((k, k + 1), |(i, j)| {
        if j == k {
            Complex64::new(anchor, 0.0)
        } else if i == j {
            Complex64::new(0.0, 0.0)
        } else {
            a[[i, j]]
        }
    });
    let u = Array2::from_shape_fn((m, k), |(l, ue)| complex(layout.u(l, ue)));

    SocpSolution {
        status,
        a,
        a_diag,
        a_tilde,
        u,
        iterations,
        solve_time,
    }
}

/// Largest feasible SINR target found by bisection, with its solution.
#[derive(Debug, Clone)]
pub struct SinrBound {
    pub t: f64,
    pub solution: Option<SocpSolution>,
    pub solver_calls: u32,
}

/// Bisects the SINR target in `[lower, upper]` until the bracket is narrower
/// than `tol` or `max_iter` solves have been made.
///
/// Each trial target is an independent [`SocpConstraintSolver::solve`] call; any
/// status other than [`SolveStatus::Optimal`] counts as infeasible. The
/// returned `solution` is `None` when no trial target was feasible.
pub fn bisect_max_min_sinr(
    solver: &SocpConstraintSolver,
    problem: &BeamformingProblem<'_>,
    lower: f64,
    upper: f64,
    tol: f64,
    max_iter: u32,
) -> Result<SinrBound, SocpError> {
    if !(lower.is_finite() && upper.is_finite() && 0.0 <= lower && lower < upper && tol > 0.0) {
        return Err(SocpError::InvalidBracket { lower, upper });
    }

    let (mut lo, mut hi) = (lower, upper);
    let mut best = None;
    let mut solver_calls = 0;

    while hi - lo > tol && solver_calls < max_iter {
        let mid = 0.5 * (lo + hi);
        let solution = solver.solve(mid, problem)?;
        solver_calls += 1;
        debug!(lo, hi, mid, status = ?solution.status, "bisection step");

        if solution.status.is_feasible() {
            lo = mid;
            best = Some(solution);
        } else {
            hi = mid;
        }
    }

    Ok(SinrBound {
        t: lo,
        solution: best,
        solver_calls,
    })
}

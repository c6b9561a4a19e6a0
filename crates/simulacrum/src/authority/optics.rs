//! Linear optics
//!
//! Each element is a pair of uncoupled 2x2 transfer matrices. Twiss
//! parameters, the closed orbit from a launch position and the cumulative
//! 6x6 transfer matrix are tracked element by element.

use super::lattice::{Element, ElementKind, Lattice};

pub type Matrix2 = [[f64; 2]; 2];
pub type Matrix6 = [[f64; 6]; 6];

const IDENTITY2: Matrix2 = [[1.0, 0.0], [0.0, 1.0]];

fn identity6() -> Matrix6 {
    let mut m = [[0.0; 6]; 6];
    for (i, row) in m.iter_mut().enumerate() {
        row[i] = 1.0;
    }
    m
}

fn drift(l: f64) -> Matrix2 {
    [[1.0, l], [0.0, 1.0]]
}

/// Focusing matrix for strength `k` over length `l`
fn quadrupole_plane(k: f64, l: f64) -> Matrix2 {
    if l == 0.0 {
        return [[1.0, 0.0], [-k, 1.0]];
    }
    if k == 0.0 {
        return drift(l);
    }
    if k > 0.0 {
        let sk = k.sqrt();
        let phi = sk * l;
        [[phi.cos(), phi.sin() / sk], [-sk * phi.sin(), phi.cos()]]
    } else {
        let sk = (-k).sqrt();
        let phi = sk * l;
        [[phi.cosh(), phi.sinh() / sk], [sk * phi.sinh(), phi.cosh()]]
    }
}

/// Horizontal and vertical transfer matrices of one element
pub fn element_matrices(element: &Element) -> (Matrix2, Matrix2) {
    match element.kind {
        ElementKind::Marker => (IDENTITY2, IDENTITY2),
        ElementKind::Quadrupole => (
            quadrupole_plane(element.k1, element.l),
            quadrupole_plane(-element.k1, element.l),
        ),
        ElementKind::Drift
        | ElementKind::Hkicker
        | ElementKind::Vkicker
        | ElementKind::Sbend
        | ElementKind::Monitor
        | ElementKind::Profile => (drift(element.l), drift(element.l)),
    }
}

fn embed(mx: &Matrix2, my: &Matrix2) -> Matrix6 {
    let mut m = identity6();
    for i in 0..2 {
        for j in 0..2 {
            m[i][j] = mx[i][j];
            m[i + 2][j + 2] = my[i][j];
        }
    }
    m
}

fn multiply(a: &Matrix6, b: &Matrix6) -> Matrix6 {
    let mut out = [[0.0; 6]; 6];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (0..6).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

fn apply(m: &Matrix2, v: (f64, f64)) -> (f64, f64) {
    (m[0][0] * v.0 + m[0][1] * v.1, m[1][0] * v.0 + m[1][1] * v.1)
}

// ─────────────────────────────────────────────────────────────────────────────
// Twiss
// ─────────────────────────────────────────────────────────────────────────────

/// Twiss parameters of one plane
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlaneTwiss {
    pub beta: f64,
    pub alpha: f64,
    pub eta: f64,
    pub etap: f64,
    /// Accumulated phase advance in radians
    pub psi: f64,
}

impl PlaneTwiss {
    pub fn new(beta: f64, alpha: f64) -> Self {
        Self {
            beta,
            alpha,
            ..Default::default()
        }
    }

    pub fn gamma(&self) -> f64 {
        (1.0 + self.alpha * self.alpha) / self.beta
    }

    /// Transport through `m`
    pub fn propagate(&self, m: &Matrix2) -> Self {
        let [[c, s], [cp, sp]] = *m;
        let gamma = self.gamma();

        let beta = c * c * self.beta - 2.0 * c * s * self.alpha + s * s * gamma;
        let alpha = -c * cp * self.beta + (c * sp + s * cp) * self.alpha - s * sp * gamma;
        let dpsi = s.atan2(c * self.beta - s * self.alpha);
        let (eta, etap) = apply(m, (self.eta, self.etap));

        Self {
            beta,
            alpha,
            eta,
            etap,
            psi: self.psi + dpsi,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tracking
// ─────────────────────────────────────────────────────────────────────────────

/// Launch coordinates of the reference orbit
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ParticleStart {
    pub x: f64,
    pub px: f64,
    pub y: f64,
    pub py: f64,
}

/// Optics at the exit of one element
#[derive(Debug, Clone, PartialEq)]
pub struct ElementOptics {
    pub s: f64,
    pub twiss_x: PlaneTwiss,
    pub twiss_y: PlaneTwiss,
    /// (x, px, y, py) in metres and radians
    pub orbit: [f64; 4],
    /// Cumulative transfer matrix from the start of the line
    pub rmat: Matrix6,
}

/// Track twiss, orbit and transfer matrix through every element
pub fn propagate(lattice: &Lattice, start: &ParticleStart) -> Vec<ElementOptics> {
    let mut twiss_x = PlaneTwiss::new(lattice.start.beta_x, lattice.start.alpha_x);
    let mut twiss_y = PlaneTwiss::new(lattice.start.beta_y, lattice.start.alpha_y);
    let mut x = (start.x, start.px);
    let mut y = (start.y, start.py);
    let mut rmat = identity6();
    let mut s = 0.0;

    lattice
        .elements
        .iter()
        .map(|element| {
            let (mx, my) = element_matrices(element);

            twiss_x = twiss_x.propagate(&mx);
            twiss_y = twiss_y.propagate(&my);
            x = apply(&mx, x);
            y = apply(&my, y);
            match element.kind {
                ElementKind::Hkicker => x.1 += element.hkick,
                ElementKind::Vkicker => y.1 += element.vkick,
                _ => {}
            }
            rmat = multiply(&embed(&mx, &my), &rmat);
            s += element.l;

            ElementOptics {
                s,
                twiss_x,
                twiss_y,
                orbit: [x.0, x.1, y.0, y.1],
                rmat,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::lattice::InitialTwiss;

    fn line(elements: Vec<Element>) -> Lattice {
        Lattice {
            name: "test".into(),
            energy: 1.0e9,
            start: InitialTwiss {
                beta_x: 2.0,
                alpha_x: 0.0,
                beta_y: 4.0,
                alpha_y: 0.0,
            },
            elements,
        }
    }

    fn element(name: &str, kind: ElementKind, l: f64) -> Element {
        Element {
            name: name.into(),
            kind,
            l,
            k1: 0.0,
            hkick: 0.0,
            vkick: 0.0,
            angle: 0.0,
            device: None,
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_beta_grows_quadratically_in_drift() {
        let lattice = line(vec![element("D", ElementKind::Drift, 3.0)]);
        let optics = propagate(&lattice, &ParticleStart::default());

        // beta(s) = beta0 + s^2 / beta0 from a waist
        assert!(close(optics[0].twiss_x.beta, 2.0 + 9.0 / 2.0));
        assert!(close(optics[0].twiss_y.beta, 4.0 + 9.0 / 4.0));
        assert!(close(optics[0].twiss_x.alpha, -3.0 / 2.0));
        assert!(close(optics[0].rmat[0][1], 3.0));
        assert!(close(optics[0].rmat[2][3], 3.0));
        assert!(close(optics[0].s, 3.0));
    }

    #[test]
    fn test_kick_displaces_downstream_orbit() {
        let mut kicker = element("K", ElementKind::Hkicker, 0.0);
        kicker.hkick = 1e-3;
        let lattice = line(vec![kicker, element("D", ElementKind::Drift, 2.0)]);
        let optics = propagate(&lattice, &ParticleStart::default());

        assert!(close(optics[0].orbit[1], 1e-3));
        assert!(close(optics[1].orbit[0], 2e-3));
        assert!(close(optics[1].orbit[2], 0.0));
    }

    #[test]
    fn test_quadrupole_matrices_are_symplectic() {
        let mut quad = element("Q", ElementKind::Quadrupole, 0.3);
        quad.k1 = 2.5;
        let (mx, my) = element_matrices(&quad);

        let det = |m: Matrix2| m[0][0] * m[1][1] - m[0][1] * m[1][0];
        assert!(close(det(mx), 1.0));
        assert!(close(det(my), 1.0));
        // Focusing in x means defocusing in y
        assert!(mx[1][0] < 0.0);
        assert!(my[1][0] > 0.0);
    }

    #[test]
    fn test_cumulative_rmat_composes() {
        let lattice = line(vec![
            element("D1", ElementKind::Drift, 1.0),
            element("D2", ElementKind::Drift, 2.0),
        ]);
        let optics = propagate(&lattice, &ParticleStart::default());
        assert!(close(optics[1].rmat[0][1], 3.0));
        assert!(close(optics[1].rmat[4][4], 1.0));
    }

    #[test]
    fn test_phase_advance_accumulates() {
        let lattice = line(vec![
            element("D1", ElementKind::Drift, 1.0),
            element("D2", ElementKind::Drift, 1.0),
        ]);
        let optics = propagate(&lattice, &ParticleStart::default());
        assert!(optics[1].twiss_x.psi > optics[0].twiss_x.psi);
        assert!(close(optics[1].twiss_x.psi, (2.0_f64 / 2.0).atan()));
    }
}

//! Explicit embedded Runge-Kutta pairs: Dormand–Prince 5(4) and 8(5,3).

use super::common::{
    all_finite, error_scale, min_step, scaled_norm, select_initial_step, StepControl,
    StepFailure, Stepper, MAX_FACTOR, MIN_FACTOR, SAFETY,
};
use crate::solvers::SolverStats;
use crate::traits::DynamicalSystem;

/// How the embedded error estimate is formed from the stage derivatives.
#[derive(Debug, Clone, Copy)]
enum ErrorEstimate {
    /// `h * sum(E[j] * K[j])`.
    Single(&'static [f64]),
    /// Combined 5th/3rd order estimate of DOP853.
    Blended {
        e3: &'static [f64],
        e5: &'static [f64],
    },
}

/// Butcher tableau of an explicit pair. `K` carries one extra row for the
/// derivative at the new point, which the error estimate may use.
#[derive(Debug, Clone, Copy)]
pub struct Tableau {
    c: &'static [f64],
    a: &'static [&'static [f64]],
    b: &'static [f64],
    error: ErrorEstimate,
    /// Order of the error estimator, used by the step controller.
    error_order: usize,
}

impl Tableau {
    fn stages(&self) -> usize {
        self.b.len()
    }
}

pub const DORMAND_PRINCE_54: Tableau = Tableau {
    c: &[0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0],
    a: &[
        &[],
        &[1.0 / 5.0],
        &[3.0 / 40.0, 9.0 / 40.0],
        &[44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0],
        &[19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0],
        &[
            9017.0 / 3168.0,
            -355.0 / 33.0,
            46732.0 / 5247.0,
            49.0 / 176.0,
            -5103.0 / 18656.0,
        ],
    ],
    b: &[
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
    ],
    error: ErrorEstimate::Single(&[
        -71.0 / 57600.0,
        0.0,
        71.0 / 16695.0,
        -71.0 / 1920.0,
        17253.0 / 339200.0,
        -22.0 / 525.0,
        1.0 / 40.0,
    ]),
    error_order: 4,
};

const DOP853_B: [f64; 12] = [
    5.42937341165687622380535766363e-2,
    0.0,
    0.0,
    0.0,
    0.0,
    4.45031289275240888144113950566,
    1.89151789931450038304281599044,
    -5.8012039600105847814672114227,
    3.1116436695781989440891606237e-1,
    -1.52160949662516078556178806805e-1,
    2.01365400804030348374776537501e-1,
    4.47106157277725905176885569043e-2,
];

const DOP853_E3: [f64; 13] = [
    DOP853_B[0] - 0.244094488188976377952755905512,
    0.0,
    0.0,
    0.0,
    0.0,
    DOP853_B[5],
    DOP853_B[6],
    DOP853_B[7],
    DOP853_B[8] - 0.733846688281611857341361741547,
    DOP853_B[9],
    DOP853_B[10],
    DOP853_B[11] - 0.220588235294117647058823529412e-1,
    0.0,
];

const DOP853_E5: [f64; 13] = [
    0.1312004499419488073250102996e-1,
    0.0,
    0.0,
    0.0,
    0.0,
    -0.1225156446376204440720569753e+1,
    -0.4957589496572501915214079952,
    0.1664377182454986536961530415e+1,
    -0.3503288487499736816886487290,
    0.3341791187130174790297318841,
    0.8192320648511571246570742613e-1,
    -0.2235530786388629525884427845e-1,
    0.0,
];

pub const DORMAND_PRINCE_853: Tableau = Tableau {
    c: &[
        0.0,
        0.526001519587677318785587544488e-1,
        0.789002279381515978178381316732e-1,
        0.118350341907227396726757197510,
        0.281649658092772603273242802490,
        0.333333333333333333333333333333,
        0.25,
        0.307692307692307692307692307692,
        0.651282051282051282051282051282,
        0.6,
        0.857142857142857142857142857142,
        1.0,
    ],
    a: &[
        &[],
        &[5.26001519587677318785587544488e-2],
        &[1.97250569845378994544595329183e-2, 5.91751709536136983633785987549e-2],
        &[2.95875854768068491816892993775e-2, 0.0, 8.87627564304205475450678981324e-2],
        &[
            2.41365134159266685502369798665e-1,
            0.0,
            -8.84549479328286085344864962717e-1,
            9.24834003261792003115737966543e-1,
        ],
        &[
            3.7037037037037037037037037037e-2,
            0.0,
            0.0,
            1.70828608729473871279604482173e-1,
            1.25467687566822425016691814123e-1,
        ],
        &[
            3.7109375e-2,
            0.0,
            0.0,
            1.70252211019544039314978060272e-1,
            6.02165389804559606850219397283e-2,
            -1.7578125e-2,
        ],
        &[
            3.70920001185047927108779319836e-2,
            0.0,
            0.0,
            1.70383925712239993810214054705e-1,
            1.07262030446373284651809199168e-1,
            -1.53194377486244017527936158236e-2,
            8.27378916381402288758473766002e-3,
        ],
        &[
            6.24110958716075717114429577812e-1,
            0.0,
            0.0,
            -3.36089262944694129406857109825,
            -8.68219346841726006818189891453e-1,
            2.75920996994467083049415600797e1,
            2.01540675504778934086186788979e1,
            -4.34898841810699588477366255144e1,
        ],
        &[
            4.77662536438264365890433908527e-1,
            0.0,
            0.0,
            -2.48811461997166764192642586468,
            -5.90290826836842996371446475743e-1,
            2.12300514481811942347288949897e1,
            1.52792336328824235832596922938e1,
            -3.32882109689848629194453265587e1,
            -2.03312017085086261358222928593e-2,
        ],
        &[
            -9.3714243008598732571704021658e-1,
            0.0,
            0.0,
            5.18637242884406370830023853209,
            1.09143734899672957818500254654,
            -8.14978701074692612513997267357,
            -1.85200656599969598641566180701e1,
            2.27394870993505042818970056734e1,
            2.49360555267965238987089396762,
            -3.0467644718982195003823669022,
        ],
        &[
            2.27331014751653820792359768449,
            0.0,
            0.0,
            -1.05344954667372501984066689879e1,
            -2.00087205822486249909675718444,
            -1.79589318631187989172765950534e1,
            2.79488845294199600508499808837e1,
            -2.85899827713502369474065508674,
            -8.87285693353062954433549289258,
            1.23605671757943030647266201528e1,
            6.43392746015763530355970484046e-1,
        ],
    ],
    b: &DOP853_B,
    error: ErrorEstimate::Blended {
        e3: &DOP853_E3,
        e5: &DOP853_E5,
    },
    error_order: 7,
};

/// Adaptive explicit Runge-Kutta stepper driven by a [`Tableau`].
pub struct RungeKutta {
    tableau: Tableau,
    control: StepControl,
    t: f64,
    y: Vec<f64>,
    f: Vec<f64>,
    h_abs: f64,
    /// Stage derivatives, `stages + 1` rows.
    k: Vec<Vec<f64>>,
    y_new: Vec<f64>,
    f_new: Vec<f64>,
    tmp: Vec<f64>,
    stats: SolverStats,
}

impl RungeKutta {
    pub fn new<S: DynamicalSystem>(
        tableau: Tableau,
        system: &S,
        t0: f64,
        y0: &[f64],
        t_bound: f64,
        control: StepControl,
    ) -> Self {
        let n = y0.len();
        let mut stats = SolverStats::default();
        let mut f = vec![0.0; n];
        system.apply(t0, y0, &mut f);
        stats.nfev += 1;
        let h_abs = match control.first_step {
            Some(h) => h,
            None => select_initial_step(
                system,
                t0,
                y0,
                &f,
                t_bound,
                &control,
                tableau.error_order,
                &mut stats,
            ),
        };
        Self {
            tableau,
            control,
            t: t0,
            y: y0.to_vec(),
            f,
            h_abs,
            k: vec![vec![0.0; n]; tableau.stages() + 1],
            y_new: vec![0.0; n],
            f_new: vec![0.0; n],
            tmp: vec![0.0; n],
            stats,
        }
    }

    /// One trial step of size `h` from `(t, y)`; fills `y_new`, `f_new` and `k`.
    fn trial<S: DynamicalSystem>(&mut self, system: &S, h: f64) {
        let n = self.y.len();
        let stages = self.tableau.stages();
        self.k[0].copy_from_slice(&self.f);
        for s in 1..stages {
            let row = self.tableau.a[s];
            for i in 0..n {
                let dy: f64 = row.iter().enumerate().map(|(j, a)| a * self.k[j][i]).sum();
                self.tmp[i] = self.y[i] + h * dy;
            }
            let t_stage = self.t + self.tableau.c[s] * h;
            system.apply(t_stage, &self.tmp, &mut self.k[s]);
        }
        for i in 0..n {
            let dy: f64 = self
                .tableau
                .b
                .iter()
                .enumerate()
                .map(|(j, b)| b * self.k[j][i])
                .sum();
            self.y_new[i] = self.y[i] + h * dy;
        }
        system.apply(self.t + h, &self.y_new, &mut self.f_new);
        self.k[stages].copy_from_slice(&self.f_new);
        self.stats.nfev += stages;
    }

    fn combine(&self, weights: &[f64], i: usize) -> f64 {
        weights.iter().zip(&self.k).map(|(w, k)| w * k[i]).sum()
    }

    fn error_norm(&self, h: f64, scale: &[f64]) -> f64 {
        let n = self.y.len();
        match self.tableau.error {
            ErrorEstimate::Single(e) => {
                let err: Vec<f64> = (0..n).map(|i| h * self.combine(e, i)).collect();
                scaled_norm(&err, scale)
            }
            ErrorEstimate::Blended { e3, e5 } => {
                if n == 0 {
                    return 0.0;
                }
                let mut sq5 = 0.0;
                let mut sq3 = 0.0;
                for i in 0..n {
                    let err5 = self.combine(e5, i) / scale[i];
                    let err3 = self.combine(e3, i) / scale[i];
                    sq5 += err5 * err5;
                    sq3 += err3 * err3;
                }
                if sq5 == 0.0 && sq3 == 0.0 {
                    return 0.0;
                }
                let denom = sq5 + 0.01 * sq3;
                h.abs() * sq5 / (denom * n as f64).sqrt()
            }
        }
    }
}

impl Stepper for RungeKutta {
    fn t(&self) -> f64 {
        self.t
    }

    fn y(&self) -> &[f64] {
        &self.y
    }

    fn step<S: DynamicalSystem>(&mut self, system: &S, t_bound: f64) -> Result<(), StepFailure> {
        let exponent = -1.0 / (self.tableau.error_order as f64 + 1.0);
        let min_step = min_step(self.t);
        let mut h_abs = self.h_abs.clamp(min_step, self.control.max_step.max(min_step));
        let mut rejected = false;

        loop {
            if h_abs < min_step {
                return Err(StepFailure::StepSizeTooSmall { t: self.t });
            }
            let mut t_new = self.t + h_abs;
            if t_new > t_bound {
                t_new = t_bound;
            }
            let h = t_new - self.t;
            h_abs = h.abs();

            self.trial(system, h);
            let scale = error_scale(self.control.atol, self.control.rtol, &self.y, &self.y_new);
            let error_norm = self.error_norm(h, &scale);
            let finite = error_norm.is_finite() && all_finite(&self.y_new);

            if finite && error_norm < 1.0 {
                let mut factor = if error_norm == 0.0 {
                    MAX_FACTOR
                } else {
                    MAX_FACTOR.min(SAFETY * error_norm.powf(exponent))
                };
                if rejected {
                    factor = factor.min(1.0);
                }
                self.h_abs = h_abs * factor;
                self.t = t_new;
                std::mem::swap(&mut self.y, &mut self.y_new);
                std::mem::swap(&mut self.f, &mut self.f_new);
                self.stats.accepted_steps += 1;
                return Ok(());
            }

            let factor = if finite {
                MIN_FACTOR.max(SAFETY * error_norm.powf(exponent))
            } else {
                MIN_FACTOR
            };
            h_abs *= factor;
            rejected = true;
            self.stats.rejected_steps += 1;
        }
    }

    fn stats(&self) -> SolverStats {
        self.stats
    }
}

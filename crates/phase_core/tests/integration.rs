use approx::assert_relative_eq;
use phase_core::solvers::linspace;
use phase_core::{
    build_solver, parse, parse_scalar, AdaptiveSolver, Backend, Error, EventFunction,
    FixedStepSolver, InputError, IntegratorOptions, Method, ParseError, Params, Solver,
};

fn params(pairs: &[(&str, f64)]) -> Params {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

#[test]
fn adaptive_decay_matches_exponential() {
    let system = parse("x'[t] == -x[t]").expect("parse");
    let grid = linspace(0.0, 2.0, 101);
    let solution = AdaptiveSolver::default()
        .solve(&system, (0.0, 2.0), &[1.0], &Params::new(), Some(grid.as_slice()), &[])
        .expect("solve");
    assert_eq!(solution.times.len(), 101);
    for (t, y) in solution.times.iter().zip(&solution.states) {
        assert_relative_eq!(y[0], (-t).exp(), max_relative = 1e-5);
    }
}

#[test]
fn fixed_step_decay_matches_exponential() {
    let system = parse("x'[t] == -x[t]").expect("parse");
    let solution = FixedStepSolver::default()
        .solve(&system, (0.0, 2.0), &[1.0], &Params::new(), None, &[])
        .expect("solve");
    assert_eq!(solution.times.len(), 201);
    for (t, y) in solution.times.iter().zip(&solution.states) {
        assert_relative_eq!(y[0], (-t).exp(), max_relative = 5e-4);
    }
}

#[test]
fn harmonic_oscillator_with_parameters() {
    let system = parse("{x'[t], v'[t]} == {v[t], -w^2 * x[t]}").expect("parse");
    assert_eq!(system.parameters(), &["w".to_string()]);
    let p = params(&[("w", 2.0)]);
    for method in Method::ALL {
        let solver = AdaptiveSolver::new(
            IntegratorOptions::default()
                .with_method(method)
                .with_tolerances(1e-9, 1e-12),
        );
        let solution = solver
            .solve(&system, (0.0, 3.0), &[1.0, 0.0], &p, None, &[])
            .unwrap_or_else(|e| panic!("{method}: {e}"));
        let last = solution.states.last().expect("samples");
        assert!((last[0] - 6.0f64.cos()).abs() < 1e-4, "{method}: x = {}", last[0]);
        assert!((last[1] + 2.0 * 6.0f64.sin()).abs() < 1e-4, "{method}: v = {}", last[1]);
    }
}

#[test]
fn implicit_methods_handle_stiff_decay() {
    let system = parse("{x'[t], y'[t]} == {-x[t], -1000*(y[t] - Cos(t))}").expect("parse");
    for method in [Method::Radau, Method::BDF] {
        let solver = AdaptiveSolver::new(IntegratorOptions::default().with_method(method));
        let solution = solver
            .solve(&system, (0.0, 5.0), &[1.0, 0.0], &Params::new(), None, &[])
            .unwrap_or_else(|e| panic!("{method}: {e}"));
        let last = solution.states.last().expect("samples");
        assert!((last[0] - (-5.0f64).exp()).abs() < 1e-5, "{method}");
        // y relaxes onto cos(t) within a few milliseconds.
        assert!((last[1] - 5.0f64.cos()).abs() < 1e-2, "{method}");
    }
}

#[test]
fn batch_rows_match_single_solves_for_both_backends() {
    let system = parse("{x'[t], y'[t]} == {y[t], -Sin(x[t]) - c*y[t]}").expect("parse");
    let p = params(&[("c", 0.1)]);
    let batch = vec![vec![0.5, 0.0], vec![1.0, 0.5], vec![-2.0, 1.0]];

    for backend in [Backend::Adaptive, Backend::FixedStep] {
        let solver = build_solver(IntegratorOptions::default().with_backend(backend)).expect("solver");
        let result = solver
            .solve_batch(&system, (0.0, 10.0), &batch, &p, None, &[])
            .expect("batch");
        assert_eq!(result.trajectories.len(), batch.len());
        assert_eq!(result.times.len(), 201);
        for (row, y0) in batch.iter().enumerate() {
            let single = solver
                .solve(&system, (0.0, 10.0), y0, &p, None, &[])
                .expect("single");
            assert_eq!(result.times, single.times);
            assert_eq!(result.trajectories[row], single.states, "{backend} row {row}");
            assert_eq!(result.trajectories[row].len(), 201);
            assert!(result.trajectories[row].iter().all(|s| s.len() == 2));
        }
    }
}

#[test]
fn event_intervals_bracket_real_sign_changes() {
    let system = parse("{x'[t], v'[t]} == {v[t], -x[t]}").expect("parse");
    let vars = system.variables().to_vec();
    let crossing = parse_scalar("x[t]", &vars).expect("event");
    let no_params = Params::new();
    let bound = crossing.bind(&no_params);
    let events: [&dyn EventFunction; 1] = [&bound];

    for backend in [Backend::Adaptive, Backend::FixedStep] {
        let solver = build_solver(IntegratorOptions::default().with_backend(backend)).expect("solver");
        let solution = solver
            .solve(&system, (0.0, 10.0), &[1.0, 0.0], &no_params, None, &events)
            .expect("solve");
        let n = solution.times.len();
        let intervals = &solution.events.intervals[0];
        // cos(t) has zeros at pi/2, 3pi/2, 5pi/2 on [0, 10].
        assert_eq!(intervals.len(), 3, "{backend}");
        for &(i, j) in intervals {
            assert!(i <= n - 2);
            assert_eq!(j, i + 1);
            let a = solution.states[i][0];
            let b = solution.states[j][0];
            assert!(a.signum() != b.signum() || a == 0.0 || b == 0.0);
        }
    }
}

#[test]
fn adaptive_native_times_refine_grid_crossings() {
    let system = parse("{x'[t], v'[t]} == {v[t], -x[t]}").expect("parse");
    let vars = system.variables().to_vec();
    let crossing = parse_scalar("x[t]", &vars).expect("event");
    let no_params = Params::new();
    let bound = crossing.bind(&no_params);
    let events: [&dyn EventFunction; 1] = [&bound];
    let solution = AdaptiveSolver::default()
        .solve(&system, (0.0, 5.0), &[1.0, 0.0], &no_params, None, &events)
        .expect("solve");
    let native = &solution.events.native_times[0];
    assert_eq!(native.len(), 2);
    let half_pi = std::f64::consts::FRAC_PI_2;
    assert!((native[0] - half_pi).abs() < 1e-4);
    assert!((native[1] - 3.0 * half_pi).abs() < 1e-4);
}

#[test]
fn validation_happens_before_integration() {
    let system = parse("{x'[t], y'[t]} == {y[t], -x[t]}").expect("parse");
    let solver = AdaptiveSolver::default();
    let err = solver
        .solve_batch(
            &system,
            (0.0, 1.0),
            &[vec![1.0, 0.0], vec![1.0]],
            &Params::new(),
            None,
            &[],
        )
        .expect_err("ragged batch");
    assert_eq!(
        err,
        Error::Input(InputError::DimensionMismatch {
            expected: 2,
            found: 1
        })
    );
    let err = solver
        .solve(
            &system,
            (0.0, 1.0),
            &[1.0, 0.0],
            &Params::new(),
            Some(&[0.0, 0.6, 0.4][..]),
            &[],
        )
        .expect_err("non-increasing grid");
    assert_eq!(err, Error::Input(InputError::NonIncreasingGrid { index: 2 }));
}

#[test]
fn parse_errors_surface_through_the_umbrella_error() {
    let err: Error = parse("{x'[t], y'[t]} == {1, 2, 3}").expect_err("mismatch").into();
    assert!(matches!(
        err,
        Error::Parse(ParseError::CountMismatch {
            expressions: 3,
            variables: 2
        })
    ));
    assert!(err.to_string().starts_with("rhs:"));
}

#[test]
fn options_deserialize_with_defaults() {
    let options: IntegratorOptions =
        serde_json::from_str(r#"{"method": "DOP853", "rtol": 1e-8}"#).expect("options");
    assert_eq!(options.method, Method::DOP853);
    assert_eq!(options.rtol, 1e-8);
    assert_eq!(options.atol, 1e-9);
    assert_eq!(options.backend, Backend::Adaptive);

    let fixed: IntegratorOptions =
        serde_json::from_str(r#"{"backend": "rk4"}"#).expect("alias");
    assert_eq!(fixed.backend, Backend::FixedStep);

    let unknown = serde_json::from_str::<IntegratorOptions>(r#"{"method": "LSODA"}"#);
    let message = unknown.expect_err("unknown method").to_string();
    assert!(message.contains("unsupported integrator method: LSODA"), "{message}");
}

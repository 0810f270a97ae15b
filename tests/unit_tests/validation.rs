use parloop::error::{Error, PlanningError};
use parloop::{
    Access, Arg, Backend, Coloring, Dat, Engine, EngineConfig, Global, Kernel, KernelBuffers, Map, MapIndex, Mat,
    Set, Shape, Sparsity,
};

fn noop(_: &mut KernelBuffers<'_, f64>) -> eyre::Result<()> {
    Ok(())
}

struct Mesh {
    cells: Set,
    vertices: Set,
    cell_vertices: Map,
}

fn mesh() -> Mesh {
    let cells = Set::new("cells", 2);
    let vertices = Set::new("vertices", 3);
    let cell_vertices = Map::from_rows("cell_vertices", &cells, &vertices, &[[0, 1], [1, 2]]).unwrap();
    Mesh {
        cells,
        vertices,
        cell_vertices,
    }
}

fn engine() -> Engine {
    Engine::new(EngineConfig::default().with_backend(Backend::Sequential)).unwrap()
}

fn planning_error<T>(result: Result<T, Error>) -> PlanningError {
    match result {
        Err(Error::Planning(err)) => err,
        Err(err) => panic!("expected a planning error, got {}", err),
        Ok(_) => panic!("expected a planning error"),
    }
}

#[test]
fn map_must_start_at_the_iteration_set() {
    let Mesh {
        cells,
        vertices,
        cell_vertices,
    } = mesh();
    let u = Dat::<f64>::new("u", &vertices, 1);
    let kernel = Kernel::new("k", vec![Shape::vector(1)], noop);

    let args = [Arg::indirect(&u, &cell_vertices, MapIndex::At(0), Access::Read)];
    let err = planning_error(engine().par_loop(&kernel, &vertices, &args));
    assert!(matches!(err, PlanningError::MapSourceMismatch { arg: 0, .. }));
    assert!(engine().par_loop(&kernel, &cells, &args).is_ok());
}

#[test]
fn dat_must_live_on_the_addressed_set() {
    let Mesh { cells, vertices, .. } = mesh();
    let u = Dat::<f64>::new("u", &vertices, 1);
    let kernel = Kernel::new("k", vec![Shape::vector(1)], noop);
    let err = planning_error(engine().par_loop(&kernel, &cells, &[Arg::dat(&u, Access::Read)]));
    assert_eq!(
        err,
        PlanningError::DatSetMismatch {
            arg: 0,
            dat: "u".to_string(),
            expected_set: "cells".to_string()
        }
    );
}

#[test]
fn map_index_must_be_within_arity() {
    let Mesh {
        cells,
        vertices,
        cell_vertices,
    } = mesh();
    let u = Dat::<f64>::new("u", &vertices, 1);
    let kernel = Kernel::new("k", vec![Shape::vector(1)], noop);
    let args = [Arg::indirect(&u, &cell_vertices, MapIndex::At(2), Access::Read)];
    let err = planning_error(engine().par_loop(&kernel, &cells, &args));
    assert_eq!(
        err,
        PlanningError::MapIndexOutOfBounds {
            arg: 0,
            index: 2,
            arity: 2
        }
    );
}

#[test]
fn writing_through_empty_map_is_rejected() {
    let Mesh { cells, vertices, .. } = mesh();
    let empty = Map::new("empty", &cells, &vertices, 0, vec![]).unwrap();
    let u = Dat::<f64>::new("u", &vertices, 1);
    let kernel = Kernel::new("k", vec![Shape::matrix(0, 1)], noop);
    let args = [Arg::indirect(&u, &empty, MapIndex::All, Access::Inc)];
    let err = planning_error(engine().par_loop(&kernel, &cells, &args));
    assert!(matches!(err, PlanningError::ZeroArityIndirection { arg: 0, .. }));
}

#[test]
fn access_modes_are_checked_per_target() {
    let Mesh {
        cells,
        vertices,
        cell_vertices,
    } = mesh();
    let u = Dat::<f64>::new("u", &cells, 1);
    let total = Global::<f64>::new("total", 1);
    let kernel = Kernel::new("k", vec![Shape::vector(1)], noop);

    let err = planning_error(engine().par_loop(&kernel, &cells, &[Arg::dat(&u, Access::Min)]));
    assert!(matches!(err, PlanningError::InvalidAccess { arg: 0, .. }));

    let err = planning_error(engine().par_loop(&kernel, &cells, &[Arg::global(&total, Access::Write)]));
    assert!(matches!(err, PlanningError::InvalidAccess { arg: 0, .. }));

    let through_map = Arg::global(&total, Access::Read).via(&cell_vertices, MapIndex::At(0));
    let err = planning_error(engine().par_loop(&kernel, &cells, &[through_map]));
    assert_eq!(err, PlanningError::GlobalThroughMap { arg: 0 });

    let sparsity = Sparsity::new("K", &[(cell_vertices.clone(), cell_vertices.clone())], (1, 1)).unwrap();
    let mat = Mat::<f64>::new("K", &sparsity);
    let kernel = Kernel::new("k", vec![Shape::matrix(2, 2)], noop);
    let args = [Arg::mat(&mat, &cell_vertices, &cell_vertices, Access::Write)];
    let err = planning_error(engine().par_loop(&kernel, &cells, &args));
    assert!(matches!(err, PlanningError::InvalidAccess { arg: 0, .. }));

    let other = Map::from_rows("other", &cells, &vertices, &[[2, 1], [1, 0]]).unwrap();
    let args = [Arg::mat(&mat, &other, &cell_vertices, Access::Inc)];
    let err = planning_error(engine().par_loop(&kernel, &cells, &args));
    assert!(matches!(err, PlanningError::MatMapsNotInSparsity { arg: 0, .. }));
}

#[test]
fn aliasing_with_a_write_is_rejected() {
    let Mesh {
        cells,
        vertices,
        cell_vertices,
    } = mesh();
    let u = Dat::<f64>::new("u", &vertices, 1);
    let kernel = Kernel::new("k", vec![Shape::vector(1), Shape::vector(1)], noop);

    let args = [
        Arg::indirect(&u, &cell_vertices, MapIndex::At(0), Access::Read),
        Arg::indirect(&u, &cell_vertices, MapIndex::At(1), Access::Inc),
    ];
    let err = planning_error(engine().par_loop(&kernel, &cells, &args));
    assert_eq!(
        err,
        PlanningError::Aliasing {
            first: 0,
            second: 1,
            name: "u".to_string()
        }
    );

    let read_twice = [
        Arg::indirect(&u, &cell_vertices, MapIndex::At(0), Access::Read),
        Arg::indirect(&u, &cell_vertices, MapIndex::At(1), Access::Read),
    ];
    assert!(engine().par_loop(&kernel, &cells, &read_twice).is_ok());
}

#[test]
fn disabled_coloring_requires_sequential_backend() {
    let Mesh {
        cells,
        vertices,
        cell_vertices,
    } = mesh();
    let u = Dat::<f64>::new("u", &vertices, 1);
    let kernel = Kernel::new("k", vec![Shape::matrix(2, 1)], noop);
    let args = [Arg::indirect(&u, &cell_vertices, MapIndex::All, Access::Inc)];

    let threaded = Engine::new(EngineConfig::default().with_coloring(Coloring::Disabled)).unwrap();
    let err = planning_error(threaded.par_loop(&kernel, &cells, &args));
    assert_eq!(err, PlanningError::ColoringDisabled);

    let sequential = Engine::new(
        EngineConfig::default()
            .with_backend(Backend::Sequential)
            .with_coloring(Coloring::Disabled),
    )
    .unwrap();
    assert!(sequential.par_loop(&kernel, &cells, &args).is_ok());
    assert_eq!(sequential.plan(&cells, &args).unwrap().num_colors(), 1);
}

#[test]
fn kernel_signature_is_checked_before_execution() {
    let Mesh {
        cells,
        vertices,
        cell_vertices,
    } = mesh();
    let u = Dat::<f64>::new("u", &vertices, 1);
    let kernel = Kernel::new("k", vec![Shape::vector(2)], |_: &mut KernelBuffers<'_, f64>| {
        eyre::bail!("must not run")
    });
    let args = [Arg::indirect(&u, &cell_vertices, MapIndex::All, Access::Inc)];
    let err = engine().par_loop(&kernel, &cells, &args).unwrap_err();
    match err {
        Error::KernelSignature(mismatch) => {
            assert_eq!(mismatch.arg, Some(0));
            assert_eq!(mismatch.expected, "1x2");
            assert_eq!(mismatch.found, "2x1");
        }
        other => panic!("unexpected error {}", other),
    }
}

use crate::integration_tests::quad_grid;
use matrixcompare::assert_matrix_eq;
use nalgebra::DMatrix;
use parloop::{Access, Arg, Backend, Dat, Engine, EngineConfig, Kernel, Map, MapIndex, Mat, Set, Shape, Sparsity};

fn interval_mesh(n: usize) -> (Set, Set, Map) {
    let cells = Set::new("cells", n);
    let vertices = Set::new("vertices", n + 1);
    let rows: Vec<[usize; 2]> = (0..n).map(|i| [i, i + 1]).collect();
    let map = Map::from_rows("cell_vertices", &cells, &vertices, &rows).unwrap();
    (cells, vertices, map)
}

fn stiffness_1d() -> Kernel<f64> {
    Kernel::<f64>::new("stiffness_1d", vec![Shape::matrix(2, 2)], |buffers| {
        buffers
            .arg_mut(0)
            .copy_from_slice(&[1.0, -1.0, -1.0, 1.0]);
        Ok(())
    })
}

#[test]
fn laplacian_1d_assembly() {
    let (cells, _, map) = interval_mesh(4);
    let sparsity = Sparsity::new("K", &[(map.clone(), map.clone())], (1, 1)).unwrap();
    let stiffness = Mat::<f64>::new("K", &sparsity);
    let engine = Engine::new(EngineConfig::default()).unwrap();

    engine
        .par_loop(&stiffness_1d(), &cells, &[Arg::mat(&stiffness, &map, &map, Access::Inc)])
        .unwrap();

    #[rustfmt::skip]
    let expected = DMatrix::from_row_slice(5, 5, &[
         1.0, -1.0,  0.0,  0.0,  0.0,
        -1.0,  2.0, -1.0,  0.0,  0.0,
         0.0, -1.0,  2.0, -1.0,  0.0,
         0.0,  0.0, -1.0,  2.0, -1.0,
         0.0,  0.0,  0.0, -1.0,  1.0,
    ]);
    assert_matrix_eq!(stiffness.to_dense(), expected);

    // Assembling again accumulates, zeroing resets
    engine
        .par_loop(&stiffness_1d(), &cells, &[Arg::mat(&stiffness, &map, &map, Access::Inc)])
        .unwrap();
    assert_matrix_eq!(stiffness.to_dense(), &expected * 2.0);
    stiffness.zero().unwrap();
    assert_matrix_eq!(stiffness.to_dense(), DMatrix::<f64>::zeros(5, 5));
}

#[test]
fn sentinel_rows_and_columns_are_dropped() {
    let (cells, _, map) = interval_mesh(4);
    let boundary = [0, 4];
    let constrained = map.with_sentinels(&boundary);
    let sparsity = Sparsity::new("K", &[(map.clone(), map.clone())], (1, 1)).unwrap();
    let stiffness = Mat::<f64>::new("K", &sparsity);
    let engine = Engine::new(EngineConfig::default()).unwrap();

    let args = [Arg::mat(&stiffness, &constrained, &constrained, Access::Inc)];
    engine.par_loop(&stiffness_1d(), &cells, &args).unwrap();
    stiffness.set_diagonal(&boundary, 1.0).unwrap();

    #[rustfmt::skip]
    let expected = DMatrix::from_row_slice(5, 5, &[
        1.0,  0.0,  0.0,  0.0, 0.0,
        0.0,  2.0, -1.0,  0.0, 0.0,
        0.0, -1.0,  2.0, -1.0, 0.0,
        0.0,  0.0, -1.0,  2.0, 0.0,
        0.0,  0.0,  0.0,  0.0, 1.0,
    ]);
    assert_matrix_eq!(stiffness.to_dense(), expected);
    // The entries stay in the pattern, but hold no contribution
    assert_eq!(stiffness.get(0, 1), Some(0.0));
}

#[test]
fn block_matrices_with_vector_valued_entities() {
    let (cells, _, map) = interval_mesh(2);
    let sparsity = Sparsity::new("K", &[(map.clone(), map.clone())], (2, 2)).unwrap();
    let mat = Mat::<f64>::new("K", &sparsity);
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let kernel = Kernel::<f64>::new("identity_blocks", vec![Shape::matrix(4, 4)], |buffers| {
        let block = buffers.arg_mut(0);
        for i in 0..4 {
            block[4 * i + i] = 1.0;
        }
        Ok(())
    });
    engine
        .par_loop(&kernel, &cells, &[Arg::mat(&mat, &map, &map, Access::Inc)])
        .unwrap();

    let expected = DMatrix::from_diagonal(&nalgebra::DVector::from_column_slice(&[1.0, 1.0, 2.0, 2.0, 1.0, 1.0]));
    assert_matrix_eq!(mat.to_dense(), expected);
}

#[test]
fn threaded_assembly_matches_sequential_assembly() {
    let grid = quad_grid(8, 7);
    let coordinates: Vec<f64> = (0..grid.vertices.total_size())
        .flat_map(|v| {
            let (i, j) = (v % 9, v / 9);
            [i as f64 * 0.125, j as f64 * 0.1 + 0.01 * (i as f64).sin()]
        })
        .collect();
    let x = Dat::from_values("x", &grid.vertices, 2, coordinates).unwrap();
    let sparsity = Sparsity::new("K", &[(grid.cell_vertices.clone(), grid.cell_vertices.clone())], (1, 1)).unwrap();

    // A geometry-dependent element matrix, so that the order of contributions matters
    let kernel = Kernel::<f64>::new("weighted_laplace", vec![Shape::matrix(4, 2), Shape::matrix(4, 4)], |buffers| {
        let (inputs, out) = buffers.split_output(1);
        let x = inputs.arg(0);
        for a in 0..4 {
            for b in 0..4 {
                let dx = x[2 * a] - x[2 * b];
                let dy = x[2 * a + 1] - x[2 * b + 1];
                out[4 * a + b] = if a == b { 1.0 } else { -(dx * dx + dy * dy).sqrt() / 3.0 };
            }
        }
        Ok(())
    });

    let assemble = |config: EngineConfig| {
        let mat = Mat::<f64>::new("K", &sparsity);
        let engine = Engine::new(config).unwrap();
        let args = [
            Arg::indirect(&x, &grid.cell_vertices, MapIndex::All, Access::Read),
            Arg::mat(&mat, &grid.cell_vertices, &grid.cell_vertices, Access::Inc),
        ];
        engine.par_loop(&kernel, &grid.cells, &args).unwrap();
        mat.to_dense()
    };

    let sequential = assemble(EngineConfig::default().with_backend(Backend::Sequential));
    let threaded = assemble(EngineConfig::default().with_num_threads(4).with_block_size(2));
    assert_eq!(sequential, threaded);
    assert!(sequential.iter().any(|&v| v != 0.0));
}

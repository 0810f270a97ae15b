//! Ranks simulated by threads that communicate through channels.
//!
//! In the main scenario a chain of 100 cells is split in half. Every rank owns 50 cells, 10 of
//! which border the other rank, and holds copies of the 10 cells of the other rank next to
//! the border.
use parloop::error::HaloExchangeError;
use parloop::{
    Access, Arg, Backend, ChannelCommunicator, Dat, Engine, EngineConfig, Error, Global, Halo, HaloNeighbor, Kernel,
    Map, MapIndex, Set, SetSizes, Shape,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const NUM_CELLS: usize = 100;

/// Local to global cell numbering of a rank.
fn global_index(rank: usize, local: usize) -> usize {
    match rank {
        0 => local,
        _ => match local {
            0..=39 => 60 + local,
            40..=49 => local + 10,
            _ => local - 10,
        },
    }
}

fn local_index(rank: usize, global: usize) -> usize {
    match rank {
        0 => global,
        _ => match global {
            50..=59 => global - 10,
            40..=49 => global + 10,
            _ => global - 60,
        },
    }
}

struct Partition {
    cells: Set,
    stencil: Map,
    global_ids: Vec<f64>,
}

fn partition(rank: usize) -> Partition {
    let sizes = SetSizes {
        core: 40,
        owned: 10,
        exec_halo: 0,
        non_exec_halo: 10,
    };
    let halo = Halo::new(vec![HaloNeighbor {
        rank: 1 - rank,
        send: (40..50).collect(),
        recv: (50..60).collect(),
    }]);
    let cells = Set::with_sizes("cells", sizes).with_halo(halo).unwrap();

    // Every cell reads its left neighbor, itself and its right neighbor. Cells at the ends of
    // the chain, and halo cells, read themselves instead of missing neighbors.
    let total = cells.total_size();
    let mut values = Vec::with_capacity(3 * total);
    for local in 0..total {
        let g = global_index(rank, local);
        if local >= cells.owned_end() {
            values.extend([local; 3]);
        } else {
            let left = if g > 0 { g - 1 } else { g };
            let right = if g + 1 < NUM_CELLS { g + 1 } else { g };
            values.extend([local_index(rank, left), local, local_index(rank, right)]);
        }
    }
    let stencil = Map::new("stencil", &cells, &cells, 3, values).unwrap();
    let global_ids = (0..total).map(|local| global_index(rank, local) as f64).collect();
    Partition {
        cells,
        stencil,
        global_ids,
    }
}

fn expected_stencil_sum(g: usize) -> f64 {
    let left = if g > 0 { g - 1 } else { g };
    let right = if g + 1 < NUM_CELLS { g + 1 } else { g };
    (left + g + right) as f64
}

fn run_on_ranks<F>(size: usize, backend: Backend, f: F)
where
    F: Fn(Engine) + Sync,
{
    let comms = ChannelCommunicator::group(size);
    thread::scope(|scope| {
        for comm in comms {
            let f = &f;
            scope.spawn(move || {
                let config = EngineConfig::default()
                    .with_backend(backend)
                    .with_num_threads(2)
                    .with_block_size(8)
                    .with_exchange_timeout(Duration::from_secs(10));
                let engine = Engine::with_communicator(config, Arc::new(comm)).unwrap();
                f(engine);
            });
        }
    });
}

fn run_on_two_ranks<F>(backend: Backend, f: F)
where
    F: Fn(Engine) + Sync,
{
    run_on_ranks(2, backend, f)
}

fn halo_scenario(backend: Backend) {
    run_on_two_ranks(backend, |engine| {
        let rank = engine.rank();
        assert_eq!(engine.size(), 2);
        let Partition {
            cells,
            stencil,
            global_ids,
        } = partition(rank);
        let ids = Dat::from_values("ids", &cells, 1, global_ids).unwrap();
        let u = Dat::<f64>::new("u", &cells, 1);
        let v = Dat::<f64>::new("v", &cells, 1);

        let copy = Kernel::<f64>::new("copy", vec![Shape::vector(1), Shape::vector(1)], |buffers| {
            let (inputs, out) = buffers.split_output(1);
            out[0] = inputs.arg(0)[0];
            Ok(())
        });
        engine
            .par_loop(&copy, &cells, &[Arg::dat(&ids, Access::Read), Arg::dat(&u, Access::Write)])
            .unwrap();
        assert!(u.is_halo_dirty());
        assert_eq!(engine.stats().halo_exchanges, 0);

        let stencil_sum = Kernel::<f64>::new("stencil_sum", vec![Shape::matrix(3, 1), Shape::vector(1)], |buffers| {
            let (inputs, out) = buffers.split_output(1);
            out[0] = inputs.arg(0).iter().sum();
            Ok(())
        });
        let args = [
            Arg::indirect(&u, &stencil, MapIndex::All, Access::Read),
            Arg::dat(&v, Access::Write),
        ];
        engine.par_loop(&stencil_sum, &cells, &args).unwrap();
        assert_eq!(engine.stats().halo_exchanges, 1);
        assert!(!u.is_halo_dirty());

        // The halo now holds the owner's values
        let values = u.to_vec();
        for local in cells.halo_range() {
            assert_eq!(values[local], global_index(rank, local) as f64);
        }
        let sums = v.to_vec();
        for local in cells.owned_range() {
            let g = global_index(rank, local);
            assert_eq!(sums[local], expected_stencil_sum(g), "rank {}, cell {}", rank, g);
        }

        // Nothing changed, so nothing is exchanged
        engine.par_loop(&stencil_sum, &cells, &args).unwrap();
        assert_eq!(engine.stats().halo_exchanges, 1);
        assert!(!engine.update_halo(&u).unwrap());

        u.mark_halo_dirty();
        assert!(engine.update_halo(&u).unwrap());
        assert_eq!(engine.stats().halo_exchanges, 2);
    });
}

#[test]
fn halo_exchange_with_overlap() {
    halo_scenario(Backend::Distributed);
}

#[test]
fn halo_exchange_before_threaded_execution() {
    halo_scenario(Backend::Threaded);
}

#[test]
fn reductions_combine_all_ranks() {
    run_on_two_ranks(Backend::Distributed, |engine| {
        let Partition { cells, global_ids, .. } = partition(engine.rank());
        let ids = Dat::from_values("ids", &cells, 1, global_ids).unwrap();
        let sum = Global::<f64>::new("sum", 1);
        let min = Global::from_values("min", vec![f64::INFINITY]);
        let max = Global::from_values("max", vec![f64::NEG_INFINITY]);
        let kernel = Kernel::<f64>::new("statistics", vec![Shape::vector(1); 4], |buffers| {
            let mut args = buffers.split_mut();
            let id = args[0][0];
            args[1][0] += id;
            args[2][0] = args[2][0].min(id);
            args[3][0] = args[3][0].max(id);
            Ok(())
        });
        let args = [
            Arg::dat(&ids, Access::Read),
            Arg::global(&sum, Access::Inc),
            Arg::global(&min, Access::Min),
            Arg::global(&max, Access::Max),
        ];
        engine.par_loop(&kernel, &cells, &args).unwrap();

        // Halo copies are not counted twice
        assert_eq!(sum.value(), vec![(0..NUM_CELLS).sum::<usize>() as f64]);
        assert_eq!(min.value(), vec![0.0]);
        assert_eq!(max.value(), vec![(NUM_CELLS - 1) as f64]);
        assert_eq!(engine.stats().reductions, 1);
    });
}

/// Ranks 0 and 1 each own two cells and hold a copy of one cell of the other. Rank 2 shares
/// nothing with anyone.
fn isolated_rank_partition(rank: usize) -> (Set, Map) {
    if rank == 2 {
        let cells = Set::new("cells", 2);
        let neighbor = Map::new("neighbor", &cells, &cells, 1, vec![0, 1]).unwrap();
        return (cells, neighbor);
    }
    let sizes = SetSizes {
        core: 1,
        owned: 1,
        exec_halo: 0,
        non_exec_halo: 1,
    };
    let halo = Halo::new(vec![HaloNeighbor {
        rank: 1 - rank,
        send: vec![1],
        recv: vec![2],
    }]);
    let cells = Set::with_sizes("cells", sizes).with_halo(halo).unwrap();
    let neighbor = Map::new("neighbor", &cells, &cells, 1, vec![0, 2, 2]).unwrap();
    (cells, neighbor)
}

fn loops_stay_in_step_with_isolated_rank(backend: Backend) {
    run_on_ranks(3, backend, |engine| {
        let rank = engine.rank();
        let (cells, neighbor) = isolated_rank_partition(rank);
        let u = Dat::<f64>::new("u", &cells, 1);
        let v = Dat::<f64>::new("v", &cells, 1);

        let fill = Kernel::<f64>::new("fill", vec![Shape::vector(1)], |buffers| {
            buffers.arg_mut(0)[0] = 1.0;
            Ok(())
        });
        engine
            .par_loop(&fill, &cells, &[Arg::dat(&u, Access::Write)])
            .unwrap();

        let copy = Kernel::<f64>::new("copy_neighbor", vec![Shape::vector(1), Shape::vector(1)], |buffers| {
            let (inputs, out) = buffers.split_output(1);
            out[0] = inputs.arg(0)[0];
            Ok(())
        });
        let copy_args = [
            Arg::indirect(&u, &neighbor, MapIndex::At(0), Access::Read),
            Arg::dat(&v, Access::Write),
        ];
        engine.par_loop(&copy, &cells, &copy_args).unwrap();
        let expected_exchanges = if rank == 2 { 0 } else { 1 };
        assert_eq!(engine.stats().halo_exchanges, expected_exchanges);

        let total = Kernel::<f64>::new("total", vec![Shape::vector(1), Shape::vector(1)], |buffers| {
            let (inputs, sum) = buffers.split_output(1);
            sum[0] += inputs.arg(0)[0];
            Ok(())
        });
        let sum = Global::<f64>::new("sum", 1);
        engine
            .par_loop(&total, &cells, &[Arg::dat(&v, Access::Read), Arg::global(&sum, Access::Inc)])
            .unwrap();
        assert_eq!(sum.value(), vec![6.0], "rank {}", rank);

        // Halo updates on some ranks only do not disturb later collectives either
        assert_eq!(engine.update_halo(&v).unwrap(), rank != 2);
        let sum = Global::<f64>::new("sum", 1);
        engine
            .par_loop(&total, &cells, &[Arg::dat(&u, Access::Read), Arg::global(&sum, Access::Inc)])
            .unwrap();
        assert_eq!(sum.value(), vec![6.0], "rank {}", rank);
        assert_eq!(engine.stats().reductions, 2);
    });
}

#[test]
fn rank_without_halo_neighbors_stays_in_step() {
    loops_stay_in_step_with_isolated_rank(Backend::Distributed);
}

#[test]
fn rank_without_halo_neighbors_stays_in_step_threaded() {
    loops_stay_in_step_with_isolated_rank(Backend::Threaded);
}

#[test]
fn exchange_timeout_comes_from_config() {
    let mut comms = ChannelCommunicator::group(2);
    let _silent_peer = comms.pop().unwrap();
    let comm = comms.pop().unwrap();
    let timeout = Duration::from_millis(50);
    let config = EngineConfig::default()
        .with_backend(Backend::Distributed)
        .with_exchange_timeout(timeout);
    let engine = Engine::with_communicator(config, Arc::new(comm)).unwrap();

    let cells = Set::new("cells", 4);
    let ones = Dat::from_values("ones", &cells, 1, vec![1.0; 4]).unwrap();
    let sum = Global::<f64>::new("sum", 1);
    let total = Kernel::<f64>::new("total", vec![Shape::vector(1), Shape::vector(1)], |buffers| {
        let (inputs, sum) = buffers.split_output(1);
        sum[0] += inputs.arg(0)[0];
        Ok(())
    });

    let start = Instant::now();
    let result = engine.par_loop(&total, &cells, &[Arg::dat(&ones, Access::Read), Arg::global(&sum, Access::Inc)]);
    let elapsed = start.elapsed();
    assert!(matches!(
        result,
        Err(Error::HaloExchange(HaloExchangeError::Timeout { peer: 1 }))
    ));
    assert!(elapsed >= timeout);
    assert!(elapsed < Duration::from_secs(10));
    assert_eq!(sum.value(), vec![0.0]);
}

/// A chain of 8 cells and 9 vertices, cell `c` joining vertices `c` and `c + 1`. Rank 0 owns
/// cells 0..4 and vertices 0..=4, rank 1 owns the rest. Vertex 4 belongs to rank 0 but is also
/// touched by cell 4, so rank 0 executes cell 4 redundantly as part of its exec halo.
struct ChainPartition {
    cells: Set,
    vertices: Set,
    cell_vertices: Map,
    /// Global number of every local vertex.
    vertex_ids: Vec<usize>,
}

fn chain_partition(rank: usize) -> ChainPartition {
    let (cell_sizes, vertex_sizes, cell_ids, vertex_ids, halo) = if rank == 0 {
        (
            SetSizes {
                core: 3,
                owned: 1,
                exec_halo: 1,
                non_exec_halo: 0,
            },
            SetSizes {
                core: 4,
                owned: 1,
                exec_halo: 0,
                non_exec_halo: 1,
            },
            vec![0, 1, 2, 3, 4],
            vec![0, 1, 2, 3, 4, 5],
            HaloNeighbor {
                rank: 1,
                send: vec![4],
                recv: vec![5],
            },
        )
    } else {
        (
            SetSizes {
                core: 3,
                owned: 1,
                exec_halo: 0,
                non_exec_halo: 0,
            },
            SetSizes {
                core: 3,
                owned: 1,
                exec_halo: 0,
                non_exec_halo: 1,
            },
            vec![5, 6, 7, 4],
            vec![6, 7, 8, 5, 4],
            HaloNeighbor {
                rank: 0,
                send: vec![3],
                recv: vec![4],
            },
        )
    };
    let cells = Set::with_sizes("cells", cell_sizes);
    let vertices = Set::with_sizes("vertices", vertex_sizes)
        .with_halo(Halo::new(vec![halo]))
        .unwrap();
    let local_vertex = |global: usize| vertex_ids.iter().position(|&id| id == global).unwrap();
    let rows: Vec<[usize; 2]> = cell_ids
        .iter()
        .map(|&c| [local_vertex(c), local_vertex(c + 1)])
        .collect();
    let cell_vertices = Map::from_rows("cell_vertices", &cells, &vertices, &rows).unwrap();
    ChainPartition {
        cells,
        vertices,
        cell_vertices,
        vertex_ids,
    }
}

fn count_cells() -> Kernel<f64> {
    Kernel::new("count_cells", vec![Shape::matrix(2, 1)], |buffers| {
        for count in buffers.arg_mut(0) {
            *count += 1.0;
        }
        Ok(())
    })
}

fn serial_chain_valence() -> Vec<f64> {
    let cells = Set::new("cells", 8);
    let vertices = Set::new("vertices", 9);
    let rows: Vec<[usize; 2]> = (0..8).map(|c| [c, c + 1]).collect();
    let cell_vertices = Map::from_rows("cell_vertices", &cells, &vertices, &rows).unwrap();
    let valence = Dat::<f64>::new("valence", &vertices, 1);
    let engine = Engine::new(EngineConfig::default().with_backend(Backend::Sequential)).unwrap();
    engine
        .par_loop(
            &count_cells(),
            &cells,
            &[Arg::indirect(&valence, &cell_vertices, MapIndex::All, Access::Inc)],
        )
        .unwrap();
    valence.to_vec()
}

fn exec_halo_increments(backend: Backend) {
    let serial = serial_chain_valence();
    assert_eq!(serial, [1.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 1.0]);

    run_on_two_ranks(backend, |engine| {
        let rank = engine.rank();
        let ChainPartition {
            cells,
            vertices,
            cell_vertices,
            vertex_ids,
        } = chain_partition(rank);
        let valence = Dat::<f64>::new("valence", &vertices, 1);
        let args = [Arg::indirect(&valence, &cell_vertices, MapIndex::All, Access::Inc)];

        // Rank 0 runs its exec halo cell as well
        let plan = engine.plan(&cells, &args).unwrap();
        assert_eq!(plan.extent(), cells.exec_end());
        engine.par_loop(&count_cells(), &cells, &args).unwrap();
        assert!(valence.is_halo_dirty());
        assert_eq!(engine.stats().halo_exchanges, 0);

        let values = valence.to_vec();
        for local in vertices.owned_range() {
            assert_eq!(values[local], serial[vertex_ids[local]], "rank {}, vertex {}", rank, vertex_ids[local]);
        }

        // Partial sums in the halo are replaced by the owner's values
        assert!(engine.update_halo(&valence).unwrap());
        let values = valence.to_vec();
        for local in vertices.halo_range() {
            assert_eq!(values[local], serial[vertex_ids[local]], "rank {}, vertex {}", rank, vertex_ids[local]);
        }
    });
}

#[test]
fn exec_halo_increments_match_serial_assembly() {
    exec_halo_increments(Backend::Distributed);
}

#[test]
fn exec_halo_increments_match_serial_assembly_threaded() {
    exec_halo_increments(Backend::Threaded);
}

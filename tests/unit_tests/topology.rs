use parloop::error::TopologyError;
use parloop::topology::{InMemoryTopology, Topology};
use parloop::{Halo, HaloNeighbor, SetSizes};

fn triangle_pair() -> InMemoryTopology {
    InMemoryTopology::new()
        .with_set("cells", SetSizes { core: 2, ..SetSizes::default() }, None)
        .with_set("vertices", SetSizes { core: 4, ..SetSizes::default() }, None)
        .with_map("cell_vertices", "cells", "vertices", 3, vec![0, 1, 2, 1, 3, 2])
}

#[test]
fn load_sets_and_maps_by_name() {
    let topology = Topology::load(&triangle_pair()).unwrap();
    let cells = topology.set("cells").unwrap();
    let vertices = topology.set("vertices").unwrap();
    let map = topology.map("cell_vertices").unwrap();

    assert_eq!(cells.total_size(), 2);
    assert_eq!(vertices.total_size(), 4);
    assert_eq!(map.source(), cells);
    assert_eq!(map.target(), vertices);
    assert_eq!(map.row(1), &[1, 3, 2]);
    assert_eq!(topology.sets().len(), 2);
    assert_eq!(topology.maps().len(), 1);
}

#[test]
fn missing_entries_are_reported() {
    let topology = Topology::load(&triangle_pair()).unwrap();
    assert_eq!(
        topology.set("edges").unwrap_err(),
        TopologyError::Missing {
            what: "set 'edges'".to_string()
        }
    );
    assert!(matches!(topology.map("edge_vertices"), Err(TopologyError::Missing { .. })));

    let dangling = triangle_pair().with_map("edge_vertices", "edges", "vertices", 2, vec![]);
    assert!(matches!(Topology::load(&dangling), Err(TopologyError::Missing { .. })));
}

#[test]
fn invalid_descriptions_are_rejected() {
    let out_of_bounds = triangle_pair().with_map("bad", "cells", "vertices", 1, vec![0, 4]);
    assert!(matches!(
        Topology::load(&out_of_bounds),
        Err(TopologyError::IndexOutOfBounds { .. })
    ));

    let bad_halo = Halo::new(vec![HaloNeighbor {
        rank: 1,
        send: vec![0],
        recv: vec![0],
    }]);
    let sizes = SetSizes {
        core: 1,
        owned: 0,
        exec_halo: 0,
        non_exec_halo: 1,
    };
    let topology = InMemoryTopology::new().with_set("cells", sizes, Some(bad_halo));
    assert!(matches!(Topology::load(&topology), Err(TopologyError::InvalidHalo { .. })));
}

#[test]
fn descriptions_deserialize_from_json() {
    let json = r#"{
        "sets": [
            { "name": "cells", "sizes": { "core": 1, "owned": 1, "exec_halo": 1, "non_exec_halo": 0 },
              "halo": { "neighbors": [ { "rank": 1, "send": [1], "recv": [2] } ] } },
            { "name": "vertices", "sizes": { "core": 4, "owned": 0, "exec_halo": 0, "non_exec_halo": 0 } }
        ],
        "maps": [
            { "name": "cell_vertices", "source": "cells", "target": "vertices", "arity": 2,
              "values": [0, 1, 1, 2, 2, 3] }
        ]
    }"#;
    let description: InMemoryTopology = serde_json::from_str(json).unwrap();
    let topology = Topology::load(&description).unwrap();
    let cells = topology.set("cells").unwrap();
    assert_eq!(cells.boundaries(), [1, 2, 3, 3]);
    assert!(cells.has_halo());
    assert_eq!(topology.map("cell_vertices").unwrap().arity(), 2);
}

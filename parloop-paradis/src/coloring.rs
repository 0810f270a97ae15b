use parloop_nested_vec::NestedVec;
use serde::{Deserialize, Serialize};

/// A coloring of the vertices of a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexColoring {
    colors: Vec<usize>,
    num_colors: usize,
}

impl VertexColoring {
    /// A coloring that puts every vertex in the same color.
    pub fn single_color(num_vertices: usize) -> Self {
        Self {
            colors: vec![0; num_vertices],
            num_colors: if num_vertices > 0 { 1 } else { 0 },
        }
    }

    pub fn num_colors(&self) -> usize {
        self.num_colors
    }

    pub fn num_vertices(&self) -> usize {
        self.colors.len()
    }

    /// The color of every vertex.
    pub fn colors(&self) -> &[usize] {
        &self.colors
    }

    /// The vertices of each color, in increasing vertex order.
    pub fn color_classes(&self) -> NestedVec<usize> {
        let mut counts = vec![0usize; self.num_colors + 1];
        for &c in &self.colors {
            counts[c + 1] += 1;
        }
        for c in 0..self.num_colors {
            counts[c + 1] += counts[c];
        }
        let offsets = counts.clone();
        let mut data = vec![0usize; self.colors.len()];
        for (vertex, &c) in self.colors.iter().enumerate() {
            data[counts[c]] = vertex;
            counts[c] += 1;
        }
        NestedVec::try_from_offsets_and_data(offsets, data).expect("Offsets are consistent by construction")
    }

    /// Whether no two adjacent vertices share a color.
    pub fn is_proper(&self, adjacency: &NestedVec<usize>) -> bool {
        adjacency.iter().enumerate().all(|(v, neighbors)| {
            neighbors
                .iter()
                .all(|&u| u == v || self.colors[u] != self.colors[v])
        })
    }
}

/// First-fit greedy coloring of the graph given by `adjacency`.
///
/// Vertices are colored in increasing index order, each receiving the lowest color not used by
/// any of its already colored neighbors. The result is therefore fully determined by the vertex
/// numbering. Self-loops are ignored.
///
/// Panics if the adjacency refers to a vertex that does not exist.
pub fn greedy_coloring(adjacency: &NestedVec<usize>) -> VertexColoring {
    let n = adjacency.len();
    let mut colors = vec![usize::MAX; n];
    // forbidden[c] == v means that color c is used by some neighbor of vertex v. Stamping with
    // the vertex index avoids clearing the table between vertices.
    let mut forbidden: Vec<usize> = Vec::new();
    let mut num_colors = 0;

    for (v, neighbors) in adjacency.iter().enumerate() {
        for &u in neighbors {
            assert!(u < n, "Adjacency refers to vertex {} which does not exist", u);
            let c = colors[u];
            if c != usize::MAX {
                forbidden[c] = v;
            }
        }

        let color = forbidden
            .iter()
            .position(|&stamp| stamp != v)
            .unwrap_or(forbidden.len());
        if color == forbidden.len() {
            forbidden.push(usize::MAX);
        }
        colors[v] = color;
        num_colors = num_colors.max(color + 1);
    }

    VertexColoring { colors, num_colors }
}

use crate::*;

/// Benefit of moving `vertex` from `source_part` to `destination_part`.
#[derive(Debug, Clone, Copy, PartialEq, new)]
pub struct VertexGain {
    pub vertex: usize,
    pub source_part: usize,
    pub destination_part: usize,
    pub gain: float,
}

impl Default for VertexGain {
    fn default() -> Self {
        VertexGain {
            vertex: 0,
            source_part: 0,
            destination_part: 0,
            gain: float::MIN,
        }
    }
}

const GAIN_TOLERANCE: float = 1e-6;

/// Binary max-heap of candidate moves with a vertex -> slot map.
///
/// Gains closer than 1e-6 are ordered by vertex weight, lighter first.
pub struct PriorityQueue {
    heap: Vec<VertexGain>,
    /// Heap slot of each vertex, `None` when not queued.
    location: Vec<Option<usize>>,
    maximum_traverse_level: usize,
    hgraph: Arc<Hypergraph>,
}

impl PriorityQueue {
    pub fn new(hgraph: Arc<Hypergraph>, maximum_traverse_level: usize) -> Self {
        PriorityQueue {
            heap: Vec::with_capacity(hgraph.num_vertices()),
            location: vec![None; hgraph.num_vertices()],
            maximum_traverse_level,
            hgraph,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
    pub fn contains(&self, vertex: usize) -> bool {
        self.location[vertex].is_some()
    }
    pub fn peek(&self) -> Option<&VertexGain> {
        self.heap.first()
    }
    pub fn get(&self, vertex: usize) -> Option<&VertexGain> {
        self.location[vertex].map(|i| &self.heap[i])
    }

    pub fn clear(&mut self) {
        for g in self.heap.drain(..) {
            self.location[g.vertex] = None;
        }
    }

    /// `vertex` must not be queued already.
    pub fn insert(&mut self, element: VertexGain) {
        debug_assert!(
            !self.contains(element.vertex),
            "vertex {} inserted twice",
            element.vertex
        );
        let slot = self.heap.len();
        self.location[element.vertex] = Some(slot);
        self.heap.push(element);
        self.heapify_up(slot);
    }

    pub fn extract_max(&mut self) -> Option<VertexGain> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.swap(0, last);
        let top = self.heap.pop()?;
        self.location[top.vertex] = None;
        if !self.heap.is_empty() {
            self.heapify_down(0);
        }
        Some(top)
    }

    /// Replaces the queued entry of `vertex`; sifts whichever way is needed.
    /// Returns false when the vertex is not queued.
    pub fn change_priority(&mut self, vertex: usize, element: VertexGain) -> bool {
        let Some(slot) = self.location[vertex] else {
            return false;
        };
        debug_assert_eq!(element.vertex, vertex);
        let old = self.heap[slot];
        self.heap[slot] = element;
        if self.ranks_above(&element, &old) {
            self.heapify_up(slot);
        } else {
            self.heapify_down(slot);
        }
        true
    }

    pub fn remove(&mut self, vertex: usize) -> Option<VertexGain> {
        let slot = self.location[vertex]?;
        let last = self.heap.len() - 1;
        self.swap(slot, last);
        let removed = self.heap.pop()?;
        self.location[vertex] = None;
        if slot < self.heap.len() {
            self.heapify_up(slot);
            self.heapify_down(slot);
        }
        Some(removed)
    }

    /// Highest ranked move that keeps both parts inside their bounds.
    ///
    /// Checks the root, then walks down the heap following the better child
    /// for at most `maximum_traverse_level` levels. A `None` answer does not
    /// prove that no feasible move exists.
    pub fn get_best_candidate(
        &self,
        curr_block_balance: &[Vec<float>],
        upper_block_balance: &[Vec<float>],
        lower_block_balance: &[Vec<float>],
    ) -> Option<VertexGain> {
        if self.heap.is_empty() {
            return None;
        }
        let feasible = |slot: usize| -> bool {
            let g = &self.heap[slot];
            let weights = self.hgraph.vertex_weight(g.vertex);
            let to = &curr_block_balance[g.destination_part];
            let from = &curr_block_balance[g.source_part];
            let upper = &upper_block_balance[g.destination_part];
            let lower = &lower_block_balance[g.source_part];
            weights
                .iter()
                .enumerate()
                .all(|(d, w)| to[d] + w < upper[d] && from[d] - w > lower[d])
        };
        if feasible(0) {
            return Some(self.heap[0]);
        }
        let n = self.heap.len();
        let mut index = 0;
        for _ in 0..self.maximum_traverse_level {
            let (left, right) = (2 * index + 1, 2 * index + 2);
            let mut candidate = None;
            if left < n && feasible(left) {
                candidate = Some(left);
            }
            if right < n
                && feasible(right)
                && candidate.map_or(true, |c| self.ranks_above(&self.heap[right], &self.heap[c]))
            {
                candidate = Some(right);
            }
            if let Some(c) = candidate {
                return Some(self.heap[c]);
            }
            if right >= n {
                return None;
            }
            index = if self.ranks_above(&self.heap[right], &self.heap[left]) {
                right
            } else {
                left
            };
        }
        None
    }

    /// Heap order and slot map agree with each other.
    pub fn check_invariant(&self) -> bool {
        let heap_ok = (1..self.heap.len()).all(|i| {
            let parent = (i - 1) / 2;
            self.heap[parent].gain >= self.heap[i].gain - GAIN_TOLERANCE
        });
        let map_ok = self
            .heap
            .iter()
            .enumerate()
            .all(|(i, g)| self.location[g.vertex] == Some(i));
        let count_ok = self.location.iter().flatten().count() == self.heap.len();
        heap_ok && map_ok && count_ok
    }

    fn ranks_above(&self, a: &VertexGain, b: &VertexGain) -> bool {
        if (a.gain - b.gain).abs() < GAIN_TOLERANCE {
            self.hgraph.vertex_weight(a.vertex)[0] < self.hgraph.vertex_weight(b.vertex)[0]
        } else {
            a.gain > b.gain
        }
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.location[self.heap[i].vertex] = Some(i);
        self.location[self.heap[j].vertex] = Some(j);
    }

    fn heapify_up(&mut self, mut slot: usize) {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if self.ranks_above(&self.heap[slot], &self.heap[parent]) {
                self.swap(slot, parent);
                slot = parent;
            } else {
                break;
            }
        }
    }

    fn heapify_down(&mut self, mut slot: usize) {
        let n = self.heap.len();
        loop {
            let (left, right) = (2 * slot + 1, 2 * slot + 2);
            let mut largest = slot;
            if left < n && self.ranks_above(&self.heap[left], &self.heap[largest]) {
                largest = left;
            }
            if right < n && self.ranks_above(&self.heap[right], &self.heap[largest]) {
                largest = right;
            }
            if largest == slot {
                break;
            }
            self.swap(slot, largest);
            slot = largest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(n: usize, weights: Vec<float>) -> Arc<Hypergraph> {
        let edges = (1..n).map(|v| vec![v - 1, v]).collect_vec();
        Arc::new(
            Hypergraph::builder()
                .num_vertices(n)
                .hyperedges(edges)
                .vertex_weights(weights.into_iter().map(|w| vec![w]).collect())
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_empty_queue_returns_none() {
        let mut pq = PriorityQueue::new(graph(3, vec![1.0; 3]), 25);
        assert!(pq.extract_max().is_none());
        assert!(pq.remove(1).is_none());
        assert!(!pq.change_priority(2, VertexGain::new(2, 0, 1, 3.0)));
        assert!(pq.get_best_candidate(&[vec![0.0]], &[vec![1.0]], &[vec![0.0]]).is_none());
        assert_eq!(VertexGain::default().gain, float::MIN);
    }

    #[test]
    fn test_heap_invariant_under_random_operations() {
        let n = 200;
        let mut rng = seeded_rng(7);
        let mut pq = PriorityQueue::new(graph(n, vec![1.0; n]), 25);
        let mut queued: Set<usize> = Set::new();
        for step in 0..5000 {
            let v = rng.random_range(0..n);
            let gain = rng.random_range(-100i32..100).float();
            match rng.random_range(0..4) {
                0 | 1 if !queued.contains(&v) => {
                    pq.insert(VertexGain::new(v, 0, 1, gain));
                    queued.insert(v);
                }
                0 | 1 => {
                    assert!(pq.change_priority(v, VertexGain::new(v, 0, 1, gain)));
                }
                2 => {
                    let removed = pq.remove(v);
                    assert_eq!(removed.is_some(), queued.remove(&v));
                }
                _ => {
                    if let Some(top) = pq.extract_max() {
                        assert!(queued.remove(&top.vertex));
                        if let Some(next) = pq.peek() {
                            assert!(next.gain <= top.gain + 1e-6);
                        }
                    }
                }
            }
            assert!(pq.check_invariant(), "invariant broken at step {step}");
            assert_eq!(pq.len(), queued.len());
        }
    }

    #[test]
    fn test_ties_prefer_lighter_vertex() {
        let mut pq = PriorityQueue::new(graph(3, vec![5.0, 1.0, 3.0]), 25);
        for v in 0..3 {
            pq.insert(VertexGain::new(v, 0, 1, 2.0));
        }
        let order = std::iter::from_fn(|| pq.extract_max()).map(|g| g.vertex).collect_vec();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_best_candidate_respects_balance() {
        // vertex 0 is heavy and would overflow part 1
        let mut pq = PriorityQueue::new(graph(4, vec![10.0, 1.0, 1.0, 1.0]), 25);
        pq.insert(VertexGain::new(0, 0, 1, 9.0));
        pq.insert(VertexGain::new(1, 0, 1, 5.0));
        pq.insert(VertexGain::new(2, 0, 1, 4.0));
        let curr = vec![vec![12.0], vec![1.0]];
        let upper = vec![vec![10.0], vec![10.0]];
        let lower = vec![vec![0.0], vec![0.0]];
        let best = pq.get_best_candidate(&curr, &upper, &lower).unwrap();
        assert_eq!(best.vertex, 1);
        let v = best.vertex;
        let w = 1.0;
        assert!(curr[1][0] + w <= upper[1][0]);
        assert!(curr[0][0] - w >= lower[0][0]);
        assert!(pq.contains(v));

        // nothing may leave part 0 once it sits at its lower bound
        let tight_lower = vec![vec![12.0], vec![0.0]];
        assert!(pq.get_best_candidate(&curr, &upper, &tight_lower).is_none());
    }
}

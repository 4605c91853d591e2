/// A non-tree chemical adjacency between two residues that are both bonded to a common third
/// residue, used for bonded-path-distance accounting across residue boundaries.
///
/// `lower_rsd < upper_rsd` always holds; `path_length` counts bonds between the two connection
/// atoms on the far sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PseudoBond {
    pub lower_rsd: usize,
    pub lower_conn: usize,
    pub upper_rsd: usize,
    pub upper_conn: usize,
    pub path_length: usize,
}

impl PseudoBond {
    /// Builds a pseudo-bond with its endpoints put in ascending residue order.
    pub fn new(
        (rsd_a, conn_a): (usize, usize),
        (rsd_b, conn_b): (usize, usize),
        path_length: usize,
    ) -> Self {
        let ((lower_rsd, lower_conn), (upper_rsd, upper_conn)) =
            if (rsd_a, conn_a) <= (rsd_b, conn_b) {
                ((rsd_a, conn_a), (rsd_b, conn_b))
            } else {
                ((rsd_b, conn_b), (rsd_a, conn_a))
            };
        Self {
            lower_rsd,
            lower_conn,
            upper_rsd,
            upper_conn,
            path_length,
        }
    }

    pub fn involves(&self, rsd: usize) -> bool {
        self.lower_rsd == rsd || self.upper_rsd == rsd
    }

    pub fn links(&self, a: usize, b: usize) -> bool {
        (self.lower_rsd, self.upper_rsd) == (a.min(b), a.max(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_orders_endpoints_by_residue() {
        let pb = PseudoBond::new((7, 1), (3, 2), 3);
        assert_eq!((pb.lower_rsd, pb.lower_conn), (3, 2));
        assert_eq!((pb.upper_rsd, pb.upper_conn), (7, 1));
        assert!(pb.links(7, 3));
        assert!(pb.involves(3));
        assert!(!pb.involves(5));
    }
}

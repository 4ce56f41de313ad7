//! Topological ordering for the index-based dependency graphs the matcher
//! and condition networks are built from.

/// Children-before-parents order over nodes `0..children.len()` with cycle
/// detection (iterative DFS, tri-color marking). `children` is the adjacency
/// list. On a cycle, returns `Err(node)` with a node on the cycle.
pub(crate) fn topo_order(children: &[Vec<usize>]) -> Result<Vec<usize>, usize> {
    const WHITE: u8 = 0;
    const GRAY: u8 = 1;
    const BLACK: u8 = 2;

    let n = children.len();
    let mut color = vec![WHITE; n];
    let mut order = Vec::with_capacity(n);

    for start in 0..n {
        if color[start] != WHITE {
            continue;
        }
        // (node, next-child cursor)
        let mut stack = vec![(start, 0usize)];
        color[start] = GRAY;

        while let Some(&mut (node, ref mut cursor)) = stack.last_mut() {
            let kids = &children[node];
            if *cursor < kids.len() {
                let child = kids[*cursor];
                *cursor += 1;
                match color[child] {
                    WHITE => {
                        color[child] = GRAY;
                        stack.push((child, 0));
                    }
                    GRAY => return Err(child),
                    _ => {}
                }
            } else {
                color[node] = BLACK;
                order.push(node);
                stack.pop();
            }
        }
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orders_children_first() {
        // 2 -> 0, 2 -> 1
        let children = vec![vec![], vec![], vec![0, 1]];
        let order = topo_order(&children).expect("acyclic");
        let pos = |i: usize| order.iter().position(|&x| x == i).unwrap();
        assert!(pos(0) < pos(2));
        assert!(pos(1) < pos(2));
    }

    #[test]
    fn test_detects_cycle() {
        let children = vec![vec![1], vec![0]];
        assert!(topo_order(&children).is_err());
    }

    #[test]
    fn test_empty_graph() {
        assert_eq!(topo_order(&[]), Ok(Vec::new()));
    }
}

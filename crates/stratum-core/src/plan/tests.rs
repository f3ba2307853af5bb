//! Plan construction tests.

use super::*;
use crate::types::{Field, FieldType, Value};

fn long(name: &str) -> Field {
    Field::new(name, FieldType::Long)
}

fn always() -> Function {
    Function::new("always", FieldType::Boolean, |_| Value::Boolean(true))
}

fn filter_of(source: &str) -> NodeKind {
    NodeKind::Filter(FilterNode {
        source: source.to_string(),
        predicate: always(),
        args: Vec::new(),
        linking: Linking::Linked,
    })
}

fn union_of(sources: &[&str]) -> NodeKind {
    NodeKind::Union(UnionNode {
        sources: sources.iter().map(ToString::to_string).collect(),
        index_field: None,
    })
}

fn chain() -> PlanBuilder {
    PlanBuilder::new()
        .scan("scan", "t", vec![long("id"), long("x")], &["id"])
        .filter("filter", "scan", always(), &["x"])
        .persist("persist", "filter", &["id"])
}

fn wide() -> PlanBuilder {
    PlanBuilder::new()
        .scan("a", "t", vec![long("id"), long("x")], &["id"])
        .scan("b", "t", vec![long("id"), long("x")], &["id"])
        .scan("c", "t", vec![long("id"), long("x")], &["id"])
        .node("fa", filter_of("a"))
        .node("fb", filter_of("b"))
        .node("u1", union_of(&["fa", "fb"]))
        .node("u2", union_of(&["u1", "c"]))
        .persist("p", "u2", &["id"])
}

#[test]
fn test_every_edge_crosses_waves_forward() {
    let plan = wide().build("p").unwrap();
    for node in plan.nodes() {
        for source in node.sources() {
            assert!(
                plan.wave_index(*source).unwrap() < plan.wave_index(node.id()).unwrap(),
                "{source} must precede {}",
                node.name()
            );
        }
    }
    assert_eq!(plan.len(), 8);
}

#[test]
fn test_waves_ordered_by_name() {
    let plan = wide().build("p").unwrap();
    let names: Vec<Vec<&str>> = plan
        .waves()
        .iter()
        .map(|w| w.iter().map(|id| plan.node(*id).unwrap().name()).collect())
        .collect();
    assert_eq!(
        names,
        vec![vec!["a", "b", "c"], vec!["fa", "fb"], vec!["u1"], vec!["u2"], vec!["p"]]
    );
}

#[test]
fn test_structurally_identical_plans_order_identically() {
    let reversed = PlanBuilder::new()
        .persist("p", "u2", &["id"])
        .node("u2", union_of(&["u1", "c"]))
        .node("u1", union_of(&["fa", "fb"]))
        .node("fb", filter_of("b"))
        .node("fa", filter_of("a"))
        .scan("c", "t", vec![long("id"), long("x")], &["id"])
        .scan("b", "t", vec![long("id"), long("x")], &["id"])
        .scan("a", "t", vec![long("id"), long("x")], &["id"]);
    let first = wide().build("p").unwrap();
    let second = reversed.build("p").unwrap();
    assert_eq!(first.waves(), second.waves());
    assert_eq!(first.toposorted(), second.toposorted());
}

#[test]
fn test_reverse_waves_reverse_each_wave() {
    let plan = wide().build("p").unwrap();
    let forward = plan.waves();
    let reverse = plan.reverse_waves();
    assert_eq!(forward.len(), reverse.len());
    for (f, r) in forward.iter().zip(reverse.iter().rev()) {
        let mut flipped = f.clone();
        flipped.reverse();
        assert_eq!(&flipped, r);
    }
}

#[test]
fn test_cycle_rejected_with_residual() {
    let err = PlanBuilder::new()
        .node("A", union_of(&["B"]))
        .node("B", union_of(&["A"]))
        .build("A")
        .unwrap_err();
    match err {
        PlanError::CycleDetected { residual } => {
            assert_eq!(residual.len(), 2);
            assert_eq!(residual["A"], vec!["B".to_string()]);
            assert_eq!(residual["B"], vec!["A".to_string()]);
        }
        other => panic!("expected cycle, got {other:?}"),
    }
}

#[test]
fn test_self_reference_is_a_cycle() {
    let err = PlanBuilder::new().node("A", union_of(&["A"])).build("A").unwrap_err();
    match err {
        PlanError::CycleDetected { residual } => {
            assert_eq!(residual["A"], vec!["A".to_string()]);
        }
        other => panic!("expected cycle, got {other:?}"),
    }
}

#[test]
fn test_duplicate_name_rejected() {
    let err = chain()
        .scan("scan", "t", vec![long("id")], &["id"])
        .build("persist")
        .unwrap_err();
    assert!(matches!(err, PlanError::DuplicateNodeName(name) if name == "scan"));
}

#[test]
fn test_unknown_source_rejected() {
    let err = PlanBuilder::new()
        .node("f", filter_of("missing"))
        .build("f")
        .unwrap_err();
    assert!(matches!(err, PlanError::NodeNotFound(name) if name == "missing"));
}

#[test]
fn test_dangling_field_rejected() {
    let err = PlanBuilder::new()
        .scan("scan", "t", vec![long("id")], &["id"])
        .filter("filter", "scan", always(), &["nope"])
        .build("filter")
        .unwrap_err();
    assert!(matches!(err, PlanError::UnknownField { field, .. } if field == "nope"));
}

#[test]
fn test_unreachable_nodes_are_dropped() {
    let plan = chain()
        .scan("other", "t", vec![long("id")], &["id"])
        .build("persist")
        .unwrap();
    assert!(plan.node_by_name("other").is_none());
    assert_eq!(plan.root().name(), "persist");
}

#[test]
fn test_node_id_is_stable_hash_of_name() {
    let plan = chain().build("persist").unwrap();
    let scan = plan.node_by_name("scan").unwrap();
    assert_eq!(scan.id(), NodeId::from_name("scan"));
    assert!(plan.get(NodeId::from_name("absent")).is_err());
}

#[test]
fn test_implicit_invalidation_skips_stateless_nodes() {
    let plan = chain().build("persist").unwrap();
    let scan = NodeId::from_name("scan");
    let sinks = plan.invalidation_sinks(scan);
    assert_eq!(sinks.len(), 1);
    assert_eq!(sinks[0].target, NodeId::from_name("persist"));
    assert_eq!(sinks[0].resolution, SinkResolution::Lineage);
    assert!(plan.invalidation_sinks(NodeId::from_name("persist")).is_empty());
}

#[test]
fn test_declared_invalidation_maps_key_fields() {
    let plan = PlanBuilder::new()
        .scan("users", "users", vec![long("id"), long("team")], &["id"])
        .persist("by_id", "users", &["id"])
        .persist_with(
            "teams",
            "by_id",
            &["team"],
            vec![Invalidation::new("by_id").key_field("id", "id").update_mask(["team"])],
        )
        .build("teams");
    // by_id feeds teams, so teams -> by_id closes a cycle.
    assert!(matches!(plan, Err(PlanError::CycleDetected { .. })));

    let plan = PlanBuilder::new()
        .scan(
            "users",
            "users",
            vec![long("id"), long("team")],
            &["id"],
        )
        .node(
            "u",
            NodeKind::Scan(ScanNode {
                table: "users".into(),
                fields: vec![long("id"), long("team")],
                id_fields: vec!["id".into()],
                invalidations: vec![Invalidation::new("copy")
                    .key_field("team", "team")
                    .update_mask(["team"])],
            }),
        )
        .persist("copy", "users", &["team"])
        .node("both", union_of(&["u", "copy"]))
        .build("both")
        .unwrap();
    let sinks = plan.invalidation_sinks(NodeId::from_name("u"));
    assert_eq!(sinks.len(), 1);
    assert_eq!(sinks[0].resolution, SinkResolution::KeyFields(vec![1]));
    assert_eq!(sinks[0].update_mask, Some(vec![1]));
}

#[test]
fn test_key_mapping_must_cover_target_id() {
    let err = PlanBuilder::new()
        .node(
            "u",
            NodeKind::Scan(ScanNode {
                table: "users".into(),
                fields: vec![long("id"), long("team")],
                id_fields: vec!["id".into()],
                invalidations: vec![Invalidation::new("copy").key_field("id", "id")],
            }),
        )
        .scan("users", "users", vec![long("id"), long("team")], &["id"])
        .persist("copy", "users", &["team"])
        .node("both", union_of(&["u", "copy"]))
        .build("both")
        .unwrap_err();
    assert!(matches!(err, PlanError::InvalidNode { node, .. } if node == "u"));
}

#[test]
fn test_union_requires_matching_schemas() {
    let err = PlanBuilder::new()
        .scan("a", "t", vec![long("id")], &["id"])
        .scan("b", "t", vec![Field::new("id", FieldType::String)], &["id"])
        .node("u", union_of(&["a", "b"]))
        .build("u")
        .unwrap_err();
    assert!(matches!(err, PlanError::InvalidNode { .. }));
}

#[test]
fn test_join_schemas() {
    let plan = PlanBuilder::new()
        .scan("l", "l", vec![long("id"), long("k")], &["id"])
        .scan("r", "r", vec![long("k"), Field::new("v", FieldType::String)], &["k"])
        .node(
            "j",
            NodeKind::Equijoin(EquijoinNode {
                branches: vec![
                    JoinBranch {
                        source: "l".into(),
                        fields: vec!["k".into()],
                    },
                    JoinBranch {
                        source: "r".into(),
                        fields: vec!["k".into()],
                    },
                ],
            }),
        )
        .node(
            "agg",
            NodeKind::ListAggregate(ListAggregateNode {
                source: "j".into(),
                group_field: "k".into(),
                list_field: "rows".into(),
            }),
        )
        .build("agg")
        .unwrap();
    let join: Vec<&str> = plan.node_by_name("j").unwrap().fields().names().collect();
    assert_eq!(join, vec!["id", "k", "v"]);
    let agg = plan.node_by_name("agg").unwrap().fields();
    assert_eq!(
        agg.type_of("rows"),
        Some(&FieldType::List(Box::new(FieldType::Struct(vec![
            long("id"),
            Field::new("v", FieldType::String)
        ]))))
    );
}

#[test]
fn test_unnest_requires_list() {
    let err = PlanBuilder::new()
        .scan("s", "t", vec![long("id")], &["id"])
        .node(
            "n",
            NodeKind::Unnest(UnnestNode {
                source: "s".into(),
                list_field: "id".into(),
                element_field: "e".into(),
                index_field: None,
            }),
        )
        .build("n")
        .unwrap_err();
    assert!(matches!(err, PlanError::InvalidNode { .. }));
}

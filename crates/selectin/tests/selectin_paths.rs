//! Loader-path resolution, nested recursion and polymorphic narrowing.

use asupersync::runtime::RuntimeBuilder;
use selectin::prelude::*;
use selectin::{ConfigErrorKind, PathRegistry};
use selectin_memory::MemorySource;
use std::sync::Arc;

fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

fn int_column(session: &Session<MemorySource>, id: EntityId, column: &str) -> Option<i64> {
    session
        .get(id)
        .and_then(|s| s.column(column))
        .and_then(Value::as_i64)
}

fn related_ids(session: &Session<MemorySource>, id: EntityId, rel: &str) -> Vec<i64> {
    session
        .related(id, rel)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|r| int_column(session, r, "id"))
        .collect()
}

fn company_registry() -> Arc<MappingRegistry> {
    MappingRegistry::builder()
        .entity(
            EntityMapping::new("Company", "companies")
                .primary_key(&["id"])
                .column("name")
                .relationship(RelationshipInfo::one_to_many(
                    "employees",
                    "Person",
                    "company_id",
                )),
        )
        .entity(
            EntityMapping::new("Person", "people")
                .primary_key(&["id"])
                .columns(&["name", "company_id"])
                .polymorphic_on("type")
                .polymorphic_identity("person"),
        )
        .entity(
            EntityMapping::subtype("Engineer", "Person")
                .polymorphic_identity("engineer")
                .column("primary_language")
                .relationship(RelationshipInfo::one_to_many(
                    "machines",
                    "Machine",
                    "engineer_id",
                )),
        )
        .entity(
            EntityMapping::subtype("Manager", "Person")
                .polymorphic_identity("manager")
                .column("status"),
        )
        .entity(
            EntityMapping::new("Machine", "machines")
                .primary_key(&["id"])
                .columns(&["name", "engineer_id"]),
        )
        .build()
        .expect("valid mapping")
}

fn company_source() -> MemorySource {
    let source = MemorySource::new();
    for (id, name) in [(1_i64, "acme"), (2, "globex")] {
        source.insert("companies", [("id", Value::from(id)), ("name", name.into())]);
    }
    for (id, kind, company) in [
        (1_i64, "engineer", 1_i64),
        (2, "manager", 1),
        (3, "engineer", 2),
        (4, "manager", 2),
    ] {
        source.insert(
            "people",
            [
                ("id", Value::from(id)),
                ("type", Value::from(kind)),
                ("company_id", Value::from(company)),
                ("name", Value::from(format!("person{id}"))),
            ],
        );
    }
    for (id, engineer) in [(100_i64, 1_i64), (101, 1), (300, 3)] {
        source.insert(
            "machines",
            [
                ("id", Value::from(id)),
                ("engineer_id", Value::from(engineer)),
                ("name", Value::from(format!("machine{id}"))),
            ],
        );
    }
    source
}

#[test]
fn narrowed_collection_loads_only_the_subtype_and_recurses() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let source = company_source();
    let mut session = Session::new(source.clone(), company_registry());
    let options = LoadOptions::new().selectin("Company", "employees[Engineer].machines");

    rt.block_on(async {
        let result = unwrap_outcome(
            session
                .query(&cx, &PrimaryQuery::new("Company"), &options)
                .await,
        );
        assert_eq!(result.report.statements, 3);

        let acme = result.entities[0];
        assert_eq!(related_ids(&session, acme, "employees"), vec![1]);
        let engineer = session.related(acme, "employees").unwrap()[0];
        assert_eq!(session.get(engineer).unwrap().entity, "Engineer");
        assert_eq!(related_ids(&session, engineer, "machines"), vec![100, 101]);

        let globex = result.entities[1];
        assert_eq!(related_ids(&session, globex, "employees"), vec![3]);
        assert_eq!(session.lookup("Person", &Key::single(2_i64)), None);

        let summary = result
            .report
            .invocations_for("machines")
            .next()
            .expect("machines invocation");
        assert_eq!(summary.path, "Company.employees[Engineer]");
    });

    let previews = source.previews();
    assert!(previews[1].contains("AND people.type IN ('engineer')"));
    assert!(previews[2].contains("WHERE machines.engineer_id IN (1, 3)"));
}

#[test]
fn subtype_rooted_directive_applies_only_to_matching_rows() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let source = company_source();
    let mut session = Session::new(source.clone(), company_registry());
    let options = LoadOptions::new().selectin("Engineer", "machines");

    rt.block_on(async {
        let result = unwrap_outcome(
            session
                .query(&cx, &PrimaryQuery::new("Person"), &options)
                .await,
        );
        let types: Vec<&str> = result
            .entities
            .iter()
            .map(|p| session.get(*p).unwrap().entity)
            .collect();
        assert_eq!(types, vec!["Engineer", "Manager", "Engineer", "Manager"]);

        assert_eq!(related_ids(&session, result.entities[0], "machines"), vec![100, 101]);
        assert_eq!(related_ids(&session, result.entities[2], "machines"), vec![300]);
        assert!(session.attribute(result.entities[1], "machines").is_none());
        assert_eq!(result.report.statements, 2);
    });
}

#[test]
fn subtype_query_filters_on_the_discriminator() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let source = company_source();
    let mut session = Session::new(source.clone(), company_registry());

    rt.block_on(async {
        let result = unwrap_outcome(
            session
                .query(&cx, &PrimaryQuery::new("Manager"), &LoadOptions::new())
                .await,
        );
        assert_eq!(result.entities.len(), 2);
    });
    assert!(source.previews()[0].contains("WHERE people.type IN ('manager')"));
}

fn tree_registry(join_depth: Option<usize>) -> Arc<MappingRegistry> {
    let mut children = RelationshipInfo::one_to_many("children", "Node", "parent_id")
        .lazy_strategy(LazyLoadStrategy::Selectin)
        .order_by("id");
    if let Some(depth) = join_depth {
        children = children.join_depth(depth);
    }
    MappingRegistry::builder()
        .entity(
            EntityMapping::new("Node", "nodes")
                .primary_key(&["id"])
                .columns(&["parent_id", "data"])
                .relationship(children),
        )
        .build()
        .expect("valid mapping")
}

/// A chain 1 -> 2 -> 3 -> 4 -> 5.
fn chain_source() -> MemorySource {
    let source = MemorySource::new();
    for id in 1..=5_i64 {
        let parent = if id == 1 { Value::Null } else { Value::from(id - 1) };
        source.insert(
            "nodes",
            [
                ("id", Value::from(id)),
                ("parent_id", parent),
                ("data", Value::from(format!("n{id}"))),
            ],
        );
    }
    source
}

#[test]
fn self_referential_recursion_stops_at_join_depth() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let source = chain_source();
    let mut session = Session::new(source.clone(), tree_registry(Some(3)));
    let root = PrimaryQuery::new("Node").filter_eq("id", 1_i64);

    rt.block_on(async {
        let result = unwrap_outcome(session.query(&cx, &root, &LoadOptions::new()).await);
        assert_eq!(result.report.statements, 4);

        let node = |id: i64| session.lookup("Node", &Key::single(id)).unwrap();
        assert_eq!(related_ids(&session, node(1), "children"), vec![2]);
        assert_eq!(related_ids(&session, node(2), "children"), vec![3]);
        assert_eq!(related_ids(&session, node(3), "children"), vec![4]);
        assert!(!session.is_loaded(node(4), "children"));
        assert!(session.lookup("Node", &Key::single(5_i64)).is_none());
    });
}

#[test]
fn self_referential_default_without_join_depth_does_not_recurse() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let source = chain_source();
    let mut session = Session::new(source.clone(), tree_registry(None));

    rt.block_on(async {
        let result = unwrap_outcome(
            session
                .query(&cx, &PrimaryQuery::new("Node"), &LoadOptions::new())
                .await,
        );
        assert_eq!(result.report.statements, 1);
        assert!(!session.is_loaded(result.entities[0], "children"));
    });
}

#[test]
fn explicit_directive_recurses_past_join_depth() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let source = chain_source();
    let mut session = Session::new(source.clone(), tree_registry(None));
    let root = PrimaryQuery::new("Node").filter_eq("id", 1_i64);
    let options = LoadOptions::new().selectin("Node", "children.children");

    rt.block_on(async {
        let result = unwrap_outcome(session.query(&cx, &root, &options).await);
        assert_eq!(result.report.statements, 3);
        let node = |id: i64| session.lookup("Node", &Key::single(id)).unwrap();
        assert_eq!(related_ids(&session, node(2), "children"), vec![3]);
        assert!(!session.is_loaded(node(3), "children"));
    });
}

fn address_registry(join_depth: Option<usize>) -> Arc<MappingRegistry> {
    let mut addresses = RelationshipInfo::one_to_many("addresses", "Address", "user_id")
        .lazy_strategy(LazyLoadStrategy::Selectin);
    let mut user = RelationshipInfo::many_to_one("user", "User", "user_id")
        .lazy_strategy(LazyLoadStrategy::Selectin);
    if let Some(depth) = join_depth {
        addresses = addresses.join_depth(depth);
        user = user.join_depth(depth);
    }
    MappingRegistry::builder()
        .entity(
            EntityMapping::new("User", "users")
                .primary_key(&["id"])
                .column("name")
                .relationship(addresses),
        )
        .entity(
            EntityMapping::new("Address", "addresses")
                .primary_key(&["id"])
                .columns(&["user_id", "email"])
                .relationship(user),
        )
        .build()
        .expect("valid mapping")
}

fn address_source() -> MemorySource {
    let source = MemorySource::new();
    for id in [7_i64, 8] {
        source.insert("users", [("id", Value::from(id)), ("name", format!("u{id}").into())]);
    }
    for (id, user) in [(1_i64, 7_i64), (2, 8), (3, 8)] {
        source.insert(
            "addresses",
            [
                ("id", Value::from(id)),
                ("user_id", Value::from(user)),
                ("email", Value::from(format!("a{id}@example.com"))),
            ],
        );
    }
    source
}

#[test]
fn bidirectional_defaults_break_the_cycle() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let source = address_source();
    let mut session = Session::new(source.clone(), address_registry(None));

    rt.block_on(async {
        let result = unwrap_outcome(
            session
                .query(&cx, &PrimaryQuery::new("User"), &LoadOptions::new())
                .await,
        );
        assert_eq!(result.report.statements, 2);
        let address = session.lookup("Address", &Key::single(1_i64)).unwrap();
        assert!(!session.is_loaded(address, "user"));
        assert_eq!(related_ids(&session, result.entities[1], "addresses"), vec![2, 3]);
    });
}

#[test]
fn bidirectional_join_depth_fills_back_references_from_the_identity_map() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let source = address_source();
    let mut session = Session::new(source.clone(), address_registry(Some(1)));

    rt.block_on(async {
        let result = unwrap_outcome(
            session
                .query(&cx, &PrimaryQuery::new("User"), &LoadOptions::new())
                .await,
        );
        assert_eq!(result.report.statements, 2);
        let summary = result.report.invocations_for("user").next().expect("user invocation");
        assert_eq!(summary.statements, 0);
        assert_eq!(summary.elided, 2);

        let address = session.lookup("Address", &Key::single(3_i64)).unwrap();
        assert_eq!(
            session.attribute(address, "user"),
            Some(&RelatedValue::One(Some(result.entities[1])))
        );
    });
}

fn shop_registry(items_strategy: Option<LazyLoadStrategy>) -> Arc<MappingRegistry> {
    let mut items = RelationshipInfo::one_to_many("items", "Item", "order_id");
    if let Some(strategy) = items_strategy {
        items = items.lazy_strategy(strategy);
    }
    MappingRegistry::builder()
        .entity(
            EntityMapping::new("User", "users")
                .primary_key(&["id"])
                .column("name")
                .relationship(RelationshipInfo::one_to_many("orders", "Order", "user_id"))
                .relationship(RelationshipInfo::one_to_many("picks", "Order", "picker_id"))
                .relationship(
                    RelationshipInfo::one_to_many("drafts", "Order", "user_id")
                        .lazy_strategy(LazyLoadStrategy::Dynamic),
                ),
        )
        .entity(
            EntityMapping::new("Order", "orders")
                .primary_key(&["id"])
                .columns(&["user_id", "picker_id"])
                .relationship(items),
        )
        .entity(
            EntityMapping::new("Item", "items")
                .primary_key(&["id"])
                .column("order_id"),
        )
        .build()
        .expect("valid mapping")
}

fn shop_source() -> MemorySource {
    let source = MemorySource::new();
    source.insert("users", [("id", Value::from(1_i64)), ("name", Value::from("ann"))]);
    for (id, user, picker) in [
        (1_i64, Value::from(1_i64), Value::Null),
        (2, Value::from(1_i64), Value::from(1_i64)),
        (3, Value::Null, Value::from(1_i64)),
    ] {
        source.insert(
            "orders",
            [("id", Value::from(id)), ("user_id", user), ("picker_id", picker)],
        );
    }
    for (id, order) in [(100_i64, 1_i64), (200, 2), (300, 3)] {
        source.insert("items", [("id", Value::from(id)), ("order_id", Value::from(order))]);
    }
    source
}

#[test]
fn diamond_paths_do_not_reload_satisfied_parents() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let source = shop_source();
    let mut session = Session::new(source.clone(), shop_registry(None));
    let options = LoadOptions::new()
        .selectin("User", "orders.items")
        .selectin("User", "picks.items")
        .populate_existing(true);

    rt.block_on(async {
        let result = unwrap_outcome(
            session
                .query(&cx, &PrimaryQuery::new("User"), &options)
                .await,
        );
        assert_eq!(result.report.statements, 5);
        let order = |id: i64| session.lookup("Order", &Key::single(id)).unwrap();
        assert_eq!(related_ids(&session, order(2), "items"), vec![200]);
        assert_eq!(related_ids(&session, order(3), "items"), vec![300]);
    });

    let previews = source.previews();
    assert_eq!(previews.len(), 5);
    assert!(previews[3].contains("WHERE items.order_id IN (1, 2)"));
    assert!(previews[4].contains("WHERE items.order_id IN (3)"));
}

#[test]
fn loaded_collections_still_feed_nested_directives() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let source = shop_source();
    let mut session = Session::new(source.clone(), shop_registry(None));
    let users = PrimaryQuery::new("User");

    rt.block_on(async {
        let first = LoadOptions::new().selectin("User", "orders");
        unwrap_outcome(session.query(&cx, &users, &first).await);

        let nested = LoadOptions::new().selectin("User", "orders.items");
        let result = unwrap_outcome(session.query(&cx, &users, &nested).await);
        assert_eq!(result.report.statements, 2);
        assert!(result.report.invocations_for("orders").next().is_none());
        let order = session.lookup("Order", &Key::single(1_i64)).unwrap();
        assert_eq!(related_ids(&session, order, "items"), vec![100]);
    });
    assert_eq!(source.statement_count(), 4);
}

#[test]
fn lazy_directive_overrides_a_mapper_default() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let source = shop_source();
    let mut session = Session::new(source.clone(), shop_registry(Some(LazyLoadStrategy::Selectin)));
    let options = LoadOptions::new().paths(
        PathRegistry::new()
            .selectin("User", "orders")
            .lazy("User", "orders.items"),
    );

    rt.block_on(async {
        let result = unwrap_outcome(
            session
                .query(&cx, &PrimaryQuery::new("User"), &options)
                .await,
        );
        assert_eq!(result.report.statements, 2);
        let order = session.lookup("Order", &Key::single(1_i64)).unwrap();
        assert!(!session.is_loaded(order, "items"));
    });
}

#[test]
fn noload_populates_empty_without_a_statement() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let source = shop_source();
    let mut session = Session::new(source.clone(), shop_registry(None));
    let options = LoadOptions::new().paths(PathRegistry::new().noload("User", "orders"));

    rt.block_on(async {
        let result = unwrap_outcome(
            session
                .query(&cx, &PrimaryQuery::new("User"), &options)
                .await,
        );
        assert_eq!(result.report.statements, 1);
        assert_eq!(result.report.populated, 1);
        assert_eq!(
            session.attribute(result.entities[0], "orders"),
            Some(&RelatedValue::Many(Vec::new()))
        );
    });
}

#[test]
fn eager_directive_on_dynamic_relationship_fails_before_any_statement() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let source = shop_source();
    let mut session = Session::new(source.clone(), shop_registry(None));
    let options = LoadOptions::new().selectin("User", "drafts");

    rt.block_on(async {
        match session
            .query(&cx, &PrimaryQuery::new("User"), &options)
            .await
        {
            Outcome::Err(e) => {
                assert_eq!(e.config_kind(), Some(ConfigErrorKind::NotPopulatable));
                assert!(e.to_string().contains("does not support object population"));
            }
            other => panic!("expected configuration error, got {other:?}"),
        }
    });
    assert_eq!(source.statement_count(), 0);
}

#[test]
fn wildcard_loads_every_populatable_relationship() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let source = shop_source();
    let mut session = Session::new(source.clone(), shop_registry(None));
    let options = LoadOptions::new().selectin("User", "*");

    rt.block_on(async {
        let result = unwrap_outcome(
            session
                .query(&cx, &PrimaryQuery::new("User"), &options)
                .await,
        );
        let ann = result.entities[0];
        assert_eq!(related_ids(&session, ann, "orders"), vec![1, 2]);
        assert_eq!(related_ids(&session, ann, "picks"), vec![2, 3]);
        assert!(!session.is_loaded(ann, "drafts"));
        assert_eq!(result.report.statements, 3);

        let order = session.lookup("Order", &Key::single(1_i64)).unwrap();
        assert!(!session.is_loaded(order, "items"));
    });
}

#[test]
fn path_length_limit_stops_recursion_with_a_diagnostic() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let source = chain_source();
    let config = LoaderConfig::default().max_path_length(2);
    let mut session = Session::with_config(source.clone(), tree_registry(Some(10)), config);
    let root = PrimaryQuery::new("Node").filter_eq("id", 1_i64);

    rt.block_on(async {
        let result = unwrap_outcome(session.query(&cx, &root, &LoadOptions::new()).await);
        assert_eq!(result.report.statements, 3);
        assert_eq!(
            result.report.diagnostics,
            vec![selectin::Diagnostic::PathLengthExceeded {
                path: "Node.children.children".to_string(),
                limit: 2,
            }]
        );
        let node = session.lookup("Node", &Key::single(3_i64)).unwrap();
        assert!(!session.is_loaded(node, "children"));
    });
}

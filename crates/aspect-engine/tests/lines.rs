mod common;

use aspect_engine::AspectSystem;
use aspect_model::{AspectDef, ChangeNotice, LineOp, LineSchema, Value};
use common::TestEvaluator;
use pretty_assertions::assert_eq;
use std::cell::RefCell;
use std::rc::Rc;

fn item_schema() -> LineSchema {
    let mut schema = LineSchema::new();
    schema.add_property(AspectDef::direct("qty").with_default(1.0));
    schema.add_property(AspectDef::direct("price").with_default(0.0));
    schema.add_property(AspectDef::formula("total", "qty * price"));
    schema
}

fn booted(defs: &[AspectDef]) -> AspectSystem {
    let mut sys = AspectSystem::with_memory_storage(Box::new(TestEvaluator));
    sys.load_definitions(defs).unwrap();
    sys.load_data("test").unwrap();
    sys
}

fn capture(sys: &mut AspectSystem) -> Rc<RefCell<Vec<ChangeNotice>>> {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    sys.set_listener(Box::new(move |notice| sink.borrow_mut().push(notice.clone())));
    log
}

#[test]
fn added_rows_start_from_schema_defaults() {
    let mut sys = booted(&[AspectDef::collection("items", item_schema())]);
    sys.add_line("items", "1").unwrap();
    assert_eq!(sys.line_ids("items"), vec!["1"]);
    assert_eq!(sys.value_of_line("items", "1", "qty"), Some(Value::Number(1.0)));
    assert_eq!(sys.value("items"), Some(Value::Number(1.0)));
}

#[test]
fn adding_an_existing_row_is_a_no_op() {
    let mut sys = booted(&[AspectDef::collection("items", item_schema())]);
    sys.add_line("items", "1").unwrap();
    let log = capture(&mut sys);
    sys.add_line("items", "1").unwrap();
    assert_eq!(sys.line_ids("items"), vec!["1"]);
    assert!(log.borrow().is_empty());
}

#[test]
fn row_formulas_stay_inside_their_row() {
    let mut sys = booted(&[AspectDef::collection("items", item_schema())]);
    sys.add_line("items", "1").unwrap();
    sys.add_line("items", "2").unwrap();
    sys.set_value_of_line("items", "1", "qty", 3.0);
    sys.set_value_of_line("items", "1", "price", 2.5);
    sys.set_value_of_line("items", "2", "qty", 5.0);
    sys.set_value_of_line("items", "2", "price", 1.0);
    assert_eq!(sys.value_of_line("items", "1", "total"), Some(Value::Number(7.5)));
    assert_eq!(sys.value_of_line("items", "2", "total"), Some(Value::Number(5.0)));
}

#[test]
fn row_edits_announce_row_context() {
    let mut sys = booted(&[AspectDef::collection("items", item_schema())]);
    sys.add_line("items", "1").unwrap();
    sys.set_value_of_line("items", "1", "price", 4.0);
    let log = capture(&mut sys);
    sys.set_value_of_line("items", "1", "qty", 2.0);
    let notices = log.borrow();
    let qty = notices.iter().find(|n| n.property.as_deref() == Some("qty"));
    let total = notices.iter().find(|n| n.property.as_deref() == Some("total"));
    assert_eq!(qty.unwrap().row_id.as_deref(), Some("1"));
    assert_eq!(total.unwrap().value, Value::Number(8.0));
}

#[test]
fn row_references_resolve_per_row() {
    let mut schema = LineSchema::new();
    schema.add_property(AspectDef::direct("kind").with_default("sword"));
    schema.add_property(AspectDef::reference("dmg", "kind"));
    let mut sys = booted(&[
        AspectDef::direct("sword").with_default(3.0),
        AspectDef::direct("axe").with_default(7.0),
        AspectDef::collection("weapons", schema),
    ]);
    sys.add_line("weapons", "a").unwrap();
    sys.add_line("weapons", "b").unwrap();
    sys.set_value_of_line("weapons", "b", "kind", "axe");
    assert_eq!(sys.value_of_line("weapons", "a", "dmg"), Some(Value::Number(3.0)));
    assert_eq!(sys.value_of_line("weapons", "b", "dmg"), Some(Value::Number(7.0)));

    // The backing aspect changes; both rows referencing it follow.
    sys.set_value("sword", 4.0);
    assert_eq!(sys.value_of_line("weapons", "a", "dmg"), Some(Value::Number(4.0)));
    assert_eq!(sys.value_of_line("weapons", "b", "dmg"), Some(Value::Number(7.0)));
}

#[test]
fn deleted_rows_disappear_entirely() {
    let mut sys = booted(&[AspectDef::collection("items", item_schema())]);
    sys.add_line("items", "1").unwrap();
    sys.add_line("items", "2").unwrap();
    let log = capture(&mut sys);
    sys.delete_line("items", "1");
    assert_eq!(sys.line_ids("items"), vec!["2"]);
    assert_eq!(sys.value("items"), Some(Value::Number(1.0)));
    assert_eq!(sys.value_of_line("items", "1", "qty"), None);
    assert_eq!(log.borrow()[0].line_op, Some(LineOp::Delete));

    // Editing the removed row is reported and ignored.
    sys.set_value_of_line("items", "1", "qty", 9.0);
    assert_eq!(sys.value_of_line("items", "1", "qty"), None);
}

#[test]
fn structural_notices_bracket_row_lifecycles() {
    let mut sys = booted(&[AspectDef::collection("items", item_schema())]);
    let log = capture(&mut sys);
    sys.add_line("items", "1").unwrap();
    let first = log.borrow()[0].clone();
    assert_eq!(first.name, "items");
    assert_eq!(first.row_id.as_deref(), Some("1"));
    assert_eq!(first.line_op, Some(LineOp::Add));
}

#[test]
fn filters_track_their_predicate() {
    let mut schema = LineSchema::new();
    schema.add_property(AspectDef::direct("x").with_default(0.0));
    let mut sys = booted(&[
        AspectDef::collection("rows", schema),
        AspectDef::filter("picked", "rows", "rows_x > 2"),
    ]);
    sys.add_line("rows", "r1").unwrap();
    sys.add_line("rows", "r2").unwrap();
    sys.set_value_of_line("rows", "r1", "x", 1.0);
    sys.set_value_of_line("rows", "r2", "x", 5.0);
    assert_eq!(sys.value("picked"), Some(Value::Ids(vec!["r2".to_string()])));

    let log = capture(&mut sys);
    sys.set_value_of_line("rows", "r1", "x", 9.0);
    assert_eq!(
        sys.value("picked"),
        Some(Value::Ids(vec!["r1".to_string(), "r2".to_string()]))
    );
    let filter_notice = log
        .borrow()
        .iter()
        .find(|n| n.name == "picked")
        .cloned()
        .expect("filter announced");
    assert_eq!(filter_notice.line_op, Some(LineOp::Filter));
}

#[test]
fn column_aggregates_track_row_changes() {
    let mut schema = LineSchema::new();
    schema.add_property(AspectDef::direct("x").with_default(2.0));
    schema.add_property(AspectDef::formula("y", "x * base"));
    let mut sys = booted(&[
        AspectDef::direct("base").with_default(3.0),
        AspectDef::collection("rows", schema),
        AspectDef::formula("agg", "sum(rows_y)"),
    ]);
    assert_eq!(sys.value("agg"), Some(Value::Number(0.0)));

    sys.add_line("rows", "1").unwrap();
    assert_eq!(sys.value_of_line("rows", "1", "y"), Some(Value::Number(6.0)));
    assert_eq!(sys.value("agg"), Some(Value::Number(6.0)));

    // An upstream edit moves the computed column; the aggregate follows.
    sys.set_value("base", 5.0);
    assert_eq!(sys.value_of_line("rows", "1", "y"), Some(Value::Number(10.0)));
    assert_eq!(sys.value("agg"), Some(Value::Number(10.0)));

    sys.add_line("rows", "2").unwrap();
    assert_eq!(sys.value("agg"), Some(Value::Number(20.0)));
}

#[test]
fn filters_react_to_row_membership() {
    let mut schema = LineSchema::new();
    schema.add_property(AspectDef::direct("x").with_default(5.0));
    let mut sys = booted(&[
        AspectDef::collection("rows", schema),
        AspectDef::filter("picked", "rows", "rows_x > 2"),
    ]);
    sys.add_line("rows", "r1").unwrap();
    assert_eq!(sys.value("picked"), Some(Value::Ids(vec!["r1".to_string()])));
    sys.delete_line("rows", "r1");
    assert_eq!(sys.value("picked"), Some(Value::Ids(Vec::new())));
}

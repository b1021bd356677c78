use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::ast::*;
use crate::engine::*;
use crate::runtime::*;
use crate::test::*;

fn emitter_updater(name: &str, params: &[&str], body: Vec<Stmt>) -> Item {
    Item::EmitterUpdater {
        name: name.into(),
        params: params.iter().map(|p| (*p).into()).collect(),
        body,
    }
}

fn bullet_action(name: &str, params: &[&str], body: Vec<Stmt>) -> Item {
    Item::Action {
        name: name.into(),
        params: params.iter().map(|p| (*p).into()).collect(),
        body,
    }
}

fn forever(body: Vec<Stmt>) -> Stmt {
    Stmt::While { condition: num(1.0), body: Box::new(Stmt::Block { body }) }
}

fn engine_with(items: Vec<Item>) -> Engine {
    let mut vm = VirtualMachine::new();
    vm.register_type("bullet", 1, 0.5).unwrap();
    vm.register_firing_function("bullet", "shoot", &["angle", "speed"]).unwrap();
    vm.compile(&Script { items }).unwrap();
    Engine::new(vm)
}

fn fire_stmt(args: Vec<Expr>, updater: Option<UpdaterCall>) -> Stmt {
    Stmt::Fire { type_name: "bullet".into(), function: "shoot".into(), args, updater }
}

#[test]
fn test_wait_schedule() {
    // two non-waiting statements, then a three frame wait, forever
    let mut engine = engine_with(vec![emitter_updater("main", &[], vec![forever(vec![
        Stmt::PostIncrement { target: prop("$offsetX") },
        Stmt::PostIncrement { target: prop("$offsetX") },
        wait(num(3.0)),
    ])])]);
    let id = engine
        .create_controller(0.0, 0.0, 0.0, true)
        .with_emitter(0.0, 0.0, 0.0, Some(("main", &[])))
        .unwrap()
        .build();
    let key = engine.controller(id).unwrap().emitters()[0];

    // first activation runs both statements and parks on the wait
    assert!(engine.update(1.0 / 60.0).is_empty());
    assert_eq!(engine.emitter(key).unwrap().offset_x, 2.0);
    assert_eq!(engine.emitter(key).unwrap().wait_timer(), 3);
    assert_eq!(engine.emitter(key).unwrap().frames_alive(), 1);

    // the next two ticks only decrement the timer
    engine.update(1.0 / 60.0);
    assert_eq!(engine.emitter(key).unwrap().offset_x, 2.0);
    engine.update(1.0 / 60.0);
    assert_eq!(engine.emitter(key).unwrap().offset_x, 2.0);

    // the third tick resumes and the cycle repeats
    engine.update(1.0 / 60.0);
    assert_eq!(engine.emitter(key).unwrap().offset_x, 4.0);
    assert_eq!(engine.emitter(key).unwrap().wait_timer(), 3);
    assert_eq!(engine.emitter(key).unwrap().frames_alive(), 4);
}

#[test]
fn test_fixed_emitter_tracks_controller() {
    let mut engine = engine_with(vec![]);
    let id = engine
        .create_controller(10.0, 20.0, 0.0, true)
        .with_emitter(1.0, 2.0, 0.0, None)
        .unwrap()
        .build();
    let key = engine.controller(id).unwrap().emitters()[0];

    assert!(engine.update(1.0 / 60.0).is_empty());
    let emitter = engine.emitter(key).unwrap();
    assert_eq!((emitter.x, emitter.y), (11.0, 22.0));
    assert_eq!(emitter.frames_alive(), 1);

    engine.controller_mut(id).unwrap().x = 50.0;
    engine.update(1.0 / 60.0);
    let emitter = engine.emitter(key).unwrap();
    assert_eq!((emitter.x, emitter.y), (51.0, 22.0));
    assert_eq!(emitter.frames_alive(), 2);
}

#[test]
fn test_orbiting_emitter_position() {
    let mut engine = engine_with(vec![]);
    let id = engine
        .create_controller(0.0, 0.0, 0.0, true)
        .with_orbiting_emitter(2.0, 0.0, None)
        .unwrap()
        .build();
    let key = engine.controller(id).unwrap().emitters()[0];

    engine.update(1.0 / 60.0);
    let emitter = engine.emitter(key).unwrap();
    assert!((emitter.x - 2.0).abs() < 1e-5);
    assert!(emitter.y.abs() < 1e-5);

    engine.emitter_mut(key).unwrap().angle = core::f32::consts::FRAC_PI_2;
    engine.update(1.0 / 60.0);
    let emitter = engine.emitter(key).unwrap();
    assert!(emitter.x.abs() < 1e-5);
    assert!((emitter.y - 2.0).abs() < 1e-5);
}

#[test]
fn test_angle_normalization() {
    let mut engine = engine_with(vec![]);
    let id = engine
        .create_controller(0.0, 0.0, 0.0, true)
        .with_emitter(0.0, 0.0, 7.0, None)
        .unwrap()
        .with_emitter(0.0, 0.0, -7.0, None)
        .unwrap()
        .build();
    let keys = engine.controller(id).unwrap().emitters().to_vec();

    engine.update(1.0 / 60.0);
    let expected = 7.0 - core::f32::consts::TAU;
    assert!((engine.emitter(keys[0]).unwrap().angle - expected).abs() < 1e-4);
    assert!((engine.emitter(keys[1]).unwrap().angle + expected).abs() < 1e-4);
}

#[test]
fn test_fire_spawns_at_emitter_context() {
    let mut engine = engine_with(vec![emitter_updater("shooter", &[], vec![forever(vec![
        fire_stmt(vec![num(0.0), num(5.0)], None),
        wait(num(2.0)),
    ])])]);
    engine
        .create_controller(3.0, 4.0, 0.0, true)
        .with_emitter(0.0, 0.0, 0.0, Some(("shooter", &[])))
        .unwrap()
        .build();

    // the bullet spawns during the emitter pass, so its first step happens
    // the same tick: it advances by its speed once
    assert!(engine.update(1.0 / 60.0).is_empty());
    assert_eq!(engine.bullet_count(), 1);
    let key = engine.bullet_keys()[0];
    let bullet = engine.bullet(key).unwrap();
    assert_eq!((bullet.x, bullet.y), (8.0, 4.0));
    assert_eq!(bullet.speed, 5.0);
    assert_eq!(bullet.radius, 0.5);
    assert_eq!(bullet.sprite_index(), 1);
    assert_eq!(bullet.frames_alive(), 1);

    // waiting emitter fires nothing; the bullet keeps moving
    engine.update(1.0 / 60.0);
    assert_eq!(engine.bullet_count(), 1);
    assert_eq!(engine.bullet(key).unwrap().x, 13.0);

    // the wait elapses and a second bullet joins, after the first
    engine.update(1.0 / 60.0);
    assert_eq!(engine.bullet_count(), 2);
    assert_eq!(engine.bullet_keys()[0], key);
}

#[test]
fn test_fire_with_updater_drives_bullet() {
    let mut engine = engine_with(vec![
        bullet_action("boost", &["v"], vec![forever(vec![
            wait(num(1.0)),
            assign(prop("$speed"), read(var("v"))),
        ])]),
        emitter_updater("shooter", &[], vec![forever(vec![
            fire_stmt(vec![num(0.0), num(5.0)], Some(UpdaterCall { name: "boost".into(), args: vec![num(9.0)] })),
            wait(num(100.0)),
        ])]),
    ]);
    engine
        .create_controller(0.0, 0.0, 0.0, true)
        .with_emitter(0.0, 0.0, 0.0, Some(("shooter", &[])))
        .unwrap()
        .build();

    engine.update(1.0 / 60.0);
    let key = engine.bullet_keys()[0];
    assert_eq!(engine.bullet(key).unwrap().speed, 5.0);

    engine.update(1.0 / 60.0);
    assert_eq!(engine.bullet(key).unwrap().speed, 9.0);
}

#[test]
fn test_runaway_updater_faults_without_hanging() {
    let mut engine = engine_with(vec![
        emitter_updater("runaway", &[], vec![forever(vec![])]),
        emitter_updater("worker", &[], vec![forever(vec![
            Stmt::PostIncrement { target: prop("$offsetX") },
            wait(num(1.0)),
        ])]),
    ]);
    let id = engine
        .create_controller(0.0, 0.0, 0.0, true)
        .with_emitter(0.0, 0.0, 0.0, Some(("runaway", &[])))
        .unwrap()
        .with_emitter(0.0, 0.0, 0.0, Some(("worker", &[])))
        .unwrap()
        .build();
    let keys = engine.controller(id).unwrap().emitters().to_vec();

    // the fault is contained: the sibling still advanced this tick
    let faults = engine.update(1.0 / 60.0);
    assert_eq!(faults, vec![EntityFault { entity: EntityId::Emitter(keys[0]), cause: ErrorCause::ExecutionLimit }]);
    assert!(!engine.emitter(keys[0]).unwrap().enabled);
    assert_eq!(engine.emitter(keys[1]).unwrap().offset_x, 1.0);

    // a faulted entity is not restarted
    let faults = engine.update(1.0 / 60.0);
    assert!(faults.is_empty());
    assert_eq!(engine.emitter(keys[1]).unwrap().offset_x, 2.0);
}

#[test]
fn test_deactivated_bullet_is_reclaimed() {
    let mut engine = engine_with(vec![emitter_updater("shooter", &[], vec![forever(vec![
        fire_stmt(vec![num(0.0), num(1.0)], None),
        wait(num(100.0)),
    ])])]);
    engine
        .create_controller(0.0, 0.0, 0.0, true)
        .with_emitter(0.0, 0.0, 0.0, Some(("shooter", &[])))
        .unwrap()
        .build();

    engine.update(1.0 / 60.0);
    let key = engine.bullet_keys()[0];
    engine.bullet_mut(key).unwrap().deactivate();

    engine.update(1.0 / 60.0);
    assert_eq!(engine.bullet_count(), 0);
    assert!(engine.bullet(key).is_none());
    assert!(engine.bullet_keys().is_empty());
}

#[test]
fn test_bullet_fired_bullet_waits_a_tick() {
    let mut engine = engine_with(vec![
        bullet_action("chain", &[], vec![
            fire_stmt(vec![num(0.0), num(1.0)], None),
            wait(num(100.0)),
        ]),
        emitter_updater("shooter", &[], vec![
            fire_stmt(vec![num(0.0), num(1.0)], Some(UpdaterCall { name: "chain".into(), args: vec![] })),
            wait(num(100.0)),
        ]),
    ]);
    engine
        .create_controller(0.0, 0.0, 0.0, true)
        .with_emitter(0.0, 0.0, 0.0, Some(("shooter", &[])))
        .unwrap()
        .build();

    // the emitter's bullet steps this tick and fires its own; that one is
    // scheduled after the snapshot and first steps next tick
    engine.update(1.0 / 60.0);
    assert_eq!(engine.bullet_count(), 2);
    let grandchild = engine.bullet_keys()[1];
    assert_eq!(engine.bullet(grandchild).unwrap().frames_alive(), 0);

    engine.update(1.0 / 60.0);
    assert_eq!(engine.bullet(grandchild).unwrap().frames_alive(), 1);
}

#[test]
fn test_disabled_controller_skips_emitters() {
    let mut engine = engine_with(vec![]);
    let id = engine
        .create_controller(10.0, 0.0, 0.0, false)
        .with_emitter(1.0, 0.0, 0.0, None)
        .unwrap()
        .build();
    let key = engine.controller(id).unwrap().emitters()[0];

    engine.update(1.0 / 60.0);
    let emitter = engine.emitter(key).unwrap();
    assert_eq!(emitter.frames_alive(), 0);
    assert_eq!(emitter.x, 0.0);

    engine.controller_mut(id).unwrap().enabled = true;
    engine.update(1.0 / 60.0);
    let emitter = engine.emitter(key).unwrap();
    assert_eq!(emitter.frames_alive(), 1);
    assert_eq!(emitter.x, 11.0);
}

#[test]
fn test_updater_arguments() {
    let mut engine = engine_with(vec![emitter_updater("spin", &["rate"], vec![forever(vec![
        assign(prop("$angle"), bin(BinaryOp::Add, read(prop("$angle")), read(var("rate")))),
        wait(num(1.0)),
    ])])]);
    let id = engine
        .create_controller(0.0, 0.0, 0.0, true)
        .with_emitter(0.0, 0.0, 0.0, Some(("spin", &[0.5])))
        .unwrap()
        .build();
    let key = engine.controller(id).unwrap().emitters()[0];

    engine.update(1.0 / 60.0);
    assert_eq!(engine.emitter(key).unwrap().angle, 0.5);
    engine.update(1.0 / 60.0);
    assert_eq!(engine.emitter(key).unwrap().angle, 1.0);
}

#[test]
fn test_builder_errors() {
    let mut engine = engine_with(vec![
        bullet_action("curve", &[], vec![wait(num(1.0))]),
        emitter_updater("spin", &["rate"], vec![wait(num(1.0))]),
    ]);

    let err = engine
        .create_controller(0.0, 0.0, 0.0, true)
        .with_emitter(0.0, 0.0, 0.0, Some(("missing", &[])))
        .unwrap_err();
    assert_eq!(err, BuildError::UnknownUpdater { name: "missing".into() });

    let err = engine
        .create_controller(0.0, 0.0, 0.0, true)
        .with_emitter(0.0, 0.0, 0.0, Some(("curve", &[])))
        .unwrap_err();
    assert_eq!(err, BuildError::WrongBlockKind { name: "curve".into() });

    let err = engine
        .create_controller(0.0, 0.0, 0.0, true)
        .with_emitter(0.0, 0.0, 0.0, Some(("spin", &[])))
        .unwrap_err();
    assert_eq!(err, BuildError::ArityMismatch { name: "spin".into(), expected: 1, got: 0 });
}

//! Controllers, emitters, bullets, and the frame scheduler that drives their
//! updater routines.
//!
//! [`Engine::update`] advances the whole simulation by one frame: every
//! enabled controller is visited in insertion order, then every enabled
//! emitter under it in insertion order, then every live bullet in insertion
//! order. An entity whose routine is waiting only has its timer decremented;
//! an eligible entity is resumed until its routine waits again, restarting
//! the routine from the top if it runs to completion. Faults deactivate only
//! the offending entity and are reported from the tick that contained them.

use alloc::vec::Vec;
use core::f32::consts::TAU;

use compact_str::CompactString;

use crate::arena::Arena;
use crate::bytecode::{BlockKind, Property, Registry};
use crate::define_key;
use crate::process::{Process, StepResult};
use crate::runtime::*;

/// Instructions one entity may execute in a single tick before its routine
/// is declared runaway. Restarting a completed routine costs fuel too, so
/// updaters that never wait always fault instead of hanging the tick.
const TICK_FUEL: usize = 65_536;

define_key! {
    /// Key of an emitter stored in the engine's entity storage.
    pub struct EmitterKey;
    /// Key of a bullet stored in the engine's entity storage.
    pub struct BulletKey;
}

/// Identifies an entity in a fault report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityId {
    Emitter(EmitterKey),
    Bullet(BulletKey),
}

/// A fault contained to a single entity during one tick. The entity was
/// deactivated and its execution context discarded; no cleanup code ran.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityFault {
    pub entity: EntityId,
    pub cause: ErrorCause,
}

/// An entity's updater binding, including its suspended execution state.
/// The process is created lazily on the first scheduling step.
#[derive(Debug, Clone)]
struct Updater {
    block: usize,
    args: Vec<f32>,
    process: Option<Process>,
}

/// A positioned, angled anchor that owns a set of emitters and supplies
/// their spatial reference frame. Controllers reference their emitters by
/// key only; the entities themselves live in the engine's storage.
#[derive(Debug)]
pub struct Controller {
    pub x: f32,
    pub y: f32,
    pub angle: f32,
    pub enabled: bool,
    emitters: Vec<EmitterKey>,
}

impl Controller {
    pub fn emitters(&self) -> &[EmitterKey] {
        &self.emitters
    }
}

/// Identifies a controller registered with an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerId(usize);

/// A scripted entity attached to a controller that fires projectiles
/// according to its updater routine.
///
/// Position is recomputed from the owning controller every tick: orbiting
/// emitters ride a circle of `orbit_distance` around it at their own angle,
/// fixed emitters sit at `(offset_x, offset_y)` from it.
#[derive(Debug)]
pub struct Emitter {
    pub x: f32,
    pub y: f32,
    pub angle: f32,
    pub orbiting: bool,
    pub orbit_distance: f32,
    pub offset_x: f32,
    pub offset_y: f32,
    pub enabled: bool,
    frames_alive: u32,
    wait_timer: u32,
    updater: Option<Updater>,
}

impl Emitter {
    pub fn frames_alive(&self) -> u32 {
        self.frames_alive
    }
    pub fn wait_timer(&self) -> u32 {
        self.wait_timer
    }
}

impl PropertyContext for Emitter {
    fn get_property(&self, property: Property) -> Option<f32> {
        match property {
            Property::Angle => Some(self.angle),
            Property::OrbitDistance => Some(self.orbit_distance),
            Property::OffsetX => Some(self.offset_x),
            Property::OffsetY => Some(self.offset_y),
            Property::FramesAlive => Some(self.frames_alive as f32),
            Property::Speed | Property::Radius => None,
        }
    }
    fn set_property(&mut self, property: Property, value: f32) -> bool {
        match property {
            Property::Angle => self.angle = value,
            Property::OrbitDistance => self.orbit_distance = value,
            Property::OffsetX => self.offset_x = value,
            Property::OffsetY => self.offset_y = value,
            Property::FramesAlive | Property::Speed | Property::Radius => return false,
        }
        true
    }
}

/// A projectile entity, optionally driven by its own updater routine.
/// Bullets advance along their angle by `speed` pixels per frame.
#[derive(Debug)]
pub struct Bullet {
    pub x: f32,
    pub y: f32,
    pub angle: f32,
    pub speed: f32,
    pub radius: f32,
    sprite_index: i32,
    frames_alive: u32,
    wait_timer: u32,
    updater: Option<Updater>,
}

impl Bullet {
    /// A bullet with an invalid sprite index is inactive; its slot is
    /// reclaimed at the end of the tick and its routine never resumes.
    pub fn is_active(&self) -> bool {
        self.sprite_index >= 0
    }
    pub fn sprite_index(&self) -> i32 {
        self.sprite_index
    }
    /// Marks the bullet inactive, discarding its execution context.
    pub fn deactivate(&mut self) {
        self.sprite_index = -1;
        self.updater = None;
    }
    pub fn frames_alive(&self) -> u32 {
        self.frames_alive
    }
    pub fn wait_timer(&self) -> u32 {
        self.wait_timer
    }
}

impl PropertyContext for Bullet {
    fn get_property(&self, property: Property) -> Option<f32> {
        match property {
            Property::Angle => Some(self.angle),
            Property::Speed => Some(self.speed),
            Property::Radius => Some(self.radius),
            Property::FramesAlive => Some(self.frames_alive as f32),
            Property::OrbitDistance | Property::OffsetX | Property::OffsetY => None,
        }
    }
    fn set_property(&mut self, property: Property, value: f32) -> bool {
        match property {
            Property::Angle => self.angle = value,
            Property::Speed => self.speed = value,
            Property::Radius => self.radius = value,
            Property::FramesAlive | Property::OrbitDistance | Property::OffsetX | Property::OffsetY => return false,
        }
        true
    }
}

/// An error raised while building a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// The named block is not registered in the machine.
    UnknownUpdater { name: CompactString },
    /// The named block exists but is not an emitter updater.
    WrongBlockKind { name: CompactString },
    /// The updater declares a different number of parameters.
    ArityMismatch { name: CompactString, expected: usize, got: usize },
}

/// The simulation: a compiled [`VirtualMachine`] plus every live entity,
/// stepped one frame at a time by [`Engine::update`].
#[derive(Debug, Default)]
pub struct Engine {
    vm: VirtualMachine,
    controllers: Vec<Controller>,
    emitters: Arena<EmitterKey, Emitter>,
    bullets: Arena<BulletKey, Bullet>,
    /// Bullet keys in spawn order; the scheduler's iteration order.
    bullet_order: Vec<BulletKey>,
    /// Scratch buffer for the fire commands of the entity being stepped.
    fires: Vec<FireCommand>,
}

impl Engine {
    pub fn new(vm: VirtualMachine) -> Self {
        Engine { vm, ..Default::default() }
    }
    pub fn vm(&self) -> &VirtualMachine {
        &self.vm
    }
    pub fn vm_mut(&mut self) -> &mut VirtualMachine {
        &mut self.vm
    }
    /// Starts building a controller at the given position. Emitters are
    /// attached on the builder; [`ControllerBuilder::build`] registers the
    /// result with the engine.
    pub fn create_controller(&mut self, x: f32, y: f32, angle: f32, enabled: bool) -> ControllerBuilder<'_> {
        ControllerBuilder {
            engine: self,
            controller: Controller { x, y, angle, enabled, emitters: Vec::new() },
            staged: Vec::new(),
        }
    }
    pub fn controller(&self, id: ControllerId) -> Option<&Controller> {
        self.controllers.get(id.0)
    }
    pub fn controller_mut(&mut self, id: ControllerId) -> Option<&mut Controller> {
        self.controllers.get_mut(id.0)
    }
    pub fn emitter(&self, key: EmitterKey) -> Option<&Emitter> {
        self.emitters.get(key)
    }
    pub fn emitter_mut(&mut self, key: EmitterKey) -> Option<&mut Emitter> {
        self.emitters.get_mut(key)
    }
    pub fn bullet(&self, key: BulletKey) -> Option<&Bullet> {
        self.bullets.get(key)
    }
    pub fn bullet_mut(&mut self, key: BulletKey) -> Option<&mut Bullet> {
        self.bullets.get_mut(key)
    }
    /// Live bullet keys in spawn order.
    pub fn bullet_keys(&self) -> &[BulletKey] {
        &self.bullet_order
    }
    pub fn bullet_count(&self) -> usize {
        self.bullets.len()
    }

    /// Advances the simulation by one frame and returns the faults contained
    /// during it. The `dt` parameter is part of the host contract; scripts
    /// measure time in frames, so the tick itself is frame-wise.
    pub fn update(&mut self, _dt: f32) -> Vec<EntityFault> {
        let mut faults = Vec::new();
        let Engine { vm, controllers, emitters, bullets, bullet_order, fires } = self;

        for ci in 0..controllers.len() {
            if !controllers[ci].enabled {
                continue;
            }
            for ei in 0..controllers[ci].emitters.len() {
                let key = controllers[ci].emitters[ei];
                let (cx, cy) = (controllers[ci].x, controllers[ci].y);
                let Some(emitter) = emitters.get_mut(key) else { continue };
                if !emitter.enabled {
                    continue;
                }

                normalize_angle(&mut emitter.angle);
                if emitter.orbiting {
                    emitter.x = cx + libm::cosf(emitter.angle) * emitter.orbit_distance;
                    emitter.y = cy + libm::sinf(emitter.angle) * emitter.orbit_distance;
                } else {
                    emitter.x = cx + emitter.offset_x;
                    emitter.y = cy + emitter.offset_y;
                }

                let mut updater = emitter.updater.take();
                let outcome = match &mut updater {
                    None => None,
                    Some(updater) => {
                        if emitter.wait_timer > 0 {
                            emitter.wait_timer -= 1;
                        }
                        match emitter.wait_timer {
                            0 => Some(resume_until_wait(vm, updater, &mut *emitter, fires)),
                            _ => None,
                        }
                    }
                };
                emitter.frames_alive += 1;
                let (fx, fy, fangle) = (emitter.x, emitter.y, emitter.angle);
                match outcome {
                    None => emitter.updater = updater,
                    Some(Ok(frames)) => {
                        emitter.wait_timer = frames;
                        emitter.updater = updater;
                    }
                    Some(Err(cause)) => {
                        emitter.enabled = false;
                        fires.clear(); // spawns requested before the fault die with it
                        faults.push(EntityFault { entity: EntityId::Emitter(key), cause });
                        continue;
                    }
                }
                for command in fires.drain(..) {
                    if let Err(cause) = spawn(vm, bullets, bullet_order, command, fx, fy, fangle) {
                        if let Some(emitter) = emitters.get_mut(key) {
                            emitter.enabled = false;
                            emitter.updater = None;
                        }
                        faults.push(EntityFault { entity: EntityId::Emitter(key), cause });
                        break;
                    }
                }
            }
        }

        // bullets fired during the emitter pass are stepped this tick; bullets
        // fired by other bullets wait until the next one
        let live = bullet_order.len();
        for bi in 0..live {
            let key = bullet_order[bi];
            let Some(bullet) = bullets.get_mut(key) else { continue };
            if !bullet.is_active() {
                continue;
            }

            normalize_angle(&mut bullet.angle);
            bullet.x += libm::cosf(bullet.angle) * bullet.speed;
            bullet.y += libm::sinf(bullet.angle) * bullet.speed;

            let mut updater = bullet.updater.take();
            let outcome = match &mut updater {
                None => None,
                Some(updater) => {
                    if bullet.wait_timer > 0 {
                        bullet.wait_timer -= 1;
                    }
                    match bullet.wait_timer {
                        0 => Some(resume_until_wait(vm, updater, &mut *bullet, fires)),
                        _ => None,
                    }
                }
            };
            bullet.frames_alive += 1;
            let (fx, fy, fangle) = (bullet.x, bullet.y, bullet.angle);
            match outcome {
                None => bullet.updater = updater,
                Some(Ok(frames)) => {
                    bullet.wait_timer = frames;
                    bullet.updater = updater;
                }
                Some(Err(cause)) => {
                    bullet.deactivate();
                    fires.clear();
                    faults.push(EntityFault { entity: EntityId::Bullet(key), cause });
                    continue;
                }
            }
            for command in fires.drain(..) {
                if let Err(cause) = spawn(vm, bullets, bullet_order, command, fx, fy, fangle) {
                    if let Some(bullet) = bullets.get_mut(key) {
                        bullet.deactivate();
                    }
                    faults.push(EntityFault { entity: EntityId::Bullet(key), cause });
                    break;
                }
            }
        }

        // reclaim the slots of bullets that deactivated this tick
        bullet_order.retain(|&key| match bullets.get(key) {
            Some(bullet) if bullet.is_active() => true,
            _ => {
                bullets.remove(key);
                false
            }
        });

        faults
    }
}

/// Builder returned by [`Engine::create_controller`].
#[derive(Debug)]
pub struct ControllerBuilder<'a> {
    engine: &'a mut Engine,
    controller: Controller,
    staged: Vec<Emitter>,
}

impl ControllerBuilder<'_> {
    /// Attaches a fixed-offset emitter, optionally bound to an emitter
    /// updater with its initial arguments.
    pub fn with_emitter(mut self, offset_x: f32, offset_y: f32, angle: f32, updater: Option<(&str, &[f32])>) -> Result<Self, BuildError> {
        let updater = self.resolve_updater(updater)?;
        self.staged.push(Emitter {
            x: 0.0,
            y: 0.0,
            angle,
            orbiting: false,
            orbit_distance: 0.0,
            offset_x,
            offset_y,
            enabled: true,
            frames_alive: 0,
            wait_timer: 0,
            updater,
        });
        Ok(self)
    }
    /// Attaches an emitter that orbits the controller at the given distance.
    pub fn with_orbiting_emitter(mut self, orbit_distance: f32, angle: f32, updater: Option<(&str, &[f32])>) -> Result<Self, BuildError> {
        let updater = self.resolve_updater(updater)?;
        self.staged.push(Emitter {
            x: 0.0,
            y: 0.0,
            angle,
            orbiting: true,
            orbit_distance,
            offset_x: 0.0,
            offset_y: 0.0,
            enabled: true,
            frames_alive: 0,
            wait_timer: 0,
            updater,
        });
        Ok(self)
    }
    /// Registers the controller and its emitters with the engine.
    pub fn build(self) -> ControllerId {
        let ControllerBuilder { engine, mut controller, staged } = self;
        for emitter in staged {
            controller.emitters.push(engine.emitters.insert(emitter));
        }
        let id = ControllerId(engine.controllers.len());
        engine.controllers.push(controller);
        id
    }

    fn resolve_updater(&self, updater: Option<(&str, &[f32])>) -> Result<Option<Updater>, BuildError> {
        let Some((name, args)) = updater else { return Ok(None) };
        let block = self.engine.vm.code_block(name).ok_or(BuildError::UnknownUpdater { name: name.into() })?;
        if block.kind != BlockKind::EmitterUpdater {
            return Err(BuildError::WrongBlockKind { name: name.into() });
        }
        if args.len() != block.params.len() {
            return Err(BuildError::ArityMismatch { name: name.into(), expected: block.params.len(), got: args.len() });
        }
        Ok(Some(Updater { block: block.index, args: args.to_vec(), process: None }))
    }
}

/// Folds an angle back to within one full turn of zero, shaving whole turns
/// off one at a time so the winding direction is preserved.
fn normalize_angle(angle: &mut f32) {
    while *angle > TAU {
        *angle -= TAU;
    }
    while *angle < -TAU {
        *angle += TAU;
    }
}

/// Resumes (or lazily creates) an entity's process until it waits, and
/// returns the yielded frame delay. A routine that completes without ever
/// waiting restarts from the top within the same tick; the shared fuel
/// budget turns one that never waits into an [`ErrorCause::ExecutionLimit`]
/// fault instead of a hang.
fn resume_until_wait(
    vm: &VirtualMachine,
    updater: &mut Updater,
    context: &mut dyn PropertyContext,
    fires: &mut Vec<FireCommand>,
) -> Result<u32, ErrorCause> {
    let mut fuel = TICK_FUEL;
    let mut process = match updater.process.take() {
        Some(process) => process,
        None => Process::new(vm, updater.block, &updater.args)?,
    };
    let frames = loop {
        match process.resume(vm, context, fires, &mut fuel)? {
            StepResult::Wait { frames } => break frames,
            StepResult::Complete => {
                if fuel == 0 {
                    return Err(ErrorCause::ExecutionLimit);
                }
                fuel -= 1; // restarting costs fuel too, or an empty routine would spin
                process.initialize(vm, updater.block, &updater.args)?;
            }
        }
    };
    updater.process = Some(process);
    Ok(frames)
}

/// Instantiates the projectile a fire command requested, at the firing
/// entity's position and angle, and schedules it after every existing bullet.
fn spawn(
    vm: &VirtualMachine,
    bullets: &mut Arena<BulletKey, Bullet>,
    order: &mut Vec<BulletKey>,
    command: FireCommand,
    x: f32,
    y: f32,
    angle: f32,
) -> Result<(), ErrorCause> {
    let firing = vm
        .firing_function_record(command.firing_index)
        .ok_or(ErrorCause::InvalidFiringFunction { index: command.firing_index })?;
    let ptype = vm
        .projectile_type(command.type_index)
        .ok_or(ErrorCause::InvalidProjectileType { index: command.type_index })?;
    let mut bullet = Bullet {
        x,
        y,
        angle,
        speed: 0.0,
        radius: ptype.radius,
        sprite_index: ptype.sprite_index,
        frames_alive: 0,
        wait_timer: 0,
        updater: command.updater.map(|u| Updater { block: u.block, args: u.args, process: None }),
    };
    for (&property, &value) in firing.params.iter().zip(command.args.iter()) {
        if !bullet.set_property(property, value) {
            return Err(ErrorCause::UnsupportedProperty { property });
        }
    }
    order.push(bullets.insert(bullet));
    Ok(())
}

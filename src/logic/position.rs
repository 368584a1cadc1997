//! Sibling positions of assignments within one (type, parent group).

use crate::error::{Message, Result};
use crate::model::{Assignment, Environment, Id};
use crate::store::traits::StructureStore;

/// Siblings of `assignment` (itself included), disabled ones too, in position order.
fn siblings<'a>(env: &'a Environment, assignment: &Assignment) -> Vec<&'a Assignment> {
    env.children_of(assignment.type_id, assignment.parent_group, true)
}

/// Position to give a brand-new assignment: `desired` if free, else after the last sibling.
pub fn valid_position(env: &Environment, type_id: Id, parent_group: Option<Id>, desired: Option<i32>) -> i32 {
    let taken: Vec<i32> = env
        .children_of(type_id, parent_group, true)
        .iter()
        .map(|a| a.position)
        .collect();
    let next = taken.iter().max().map_or(0, |max| max + 1);
    match desired {
        Some(p) if p >= 0 && !taken.contains(&p) => p,
        _ => next,
    }
}

/// Lowest position a non-system-internal root assignment may take.
pub fn reserved_root_positions(env: &Environment, assignment: &Assignment) -> i32 {
    if assignment.is_system_internal() || !assignment.is_root_attached() {
        return 0;
    }
    env.system_internal_root_count() as i32
}

/// Final positions after moving `assignment` to ordinal `desired`.
fn plan(env: &Environment, assignment: &Assignment, desired: i32) -> (i32, Vec<(Id, i32)>) {
    let desired = desired.max(reserved_root_positions(env, assignment)).max(0);
    let mut planned = Vec::new();
    let mut assigned = None;
    let mut counter = 0;
    for sibling in siblings(env, assignment) {
        if sibling.id == assignment.id {
            continue;
        }
        if assigned.is_none() && counter == desired {
            assigned = Some(counter);
            counter += 1;
        }
        planned.push((sibling.id, counter));
        counter += 1;
    }
    let assigned = assigned.unwrap_or(counter);
    planned.push((assignment.id, assigned));
    (assigned, planned)
}

/// Move an assignment to `desired` among its siblings and renumber them gap-free.
///
/// Returns the position actually assigned, which differs from `desired` when it
/// was past the end or inside the system-internal block at the root.
pub fn set_assignment_position<S: StructureStore + ?Sized>(
    store: &S,
    env: &Environment,
    assignment_id: Id,
    desired: i32,
    sparse_base: i32,
) -> Result<i32> {
    let assignment = env.assignment(assignment_id)?;
    let (assigned, planned) = plan(env, assignment, desired);

    let changed: Vec<(Id, i32)> = planned
        .into_iter()
        .filter(|(id, pos)| env.assignment(*id).map_or(true, |a| a.position != *pos))
        .collect();
    if changed.is_empty() {
        return Ok(assigned);
    }

    let write = |id: Id, position: i32| -> Result<()> {
        let mut row = env.assignment(id)?.clone();
        row.position = position;
        store.update_assignment(&row).map_err(|e| {
            e.into_update(Message::new("ex.structure.assignment.position").arg(id).arg(position))
        })
    };

    // park every sibling in the sparse range first so no two rows ever share a slot
    for (offset, sibling) in siblings(env, assignment).iter().enumerate() {
        write(sibling.id, sparse_base + offset as i32)?;
    }
    for sibling in siblings(env, assignment) {
        let position = changed
            .iter()
            .find(|(id, _)| *id == sibling.id)
            .map_or(sibling.position, |(_, p)| *p);
        write(sibling.id, position)?;
    }
    log::debug!(
        "assignment {} moved to position {} ({} siblings renumbered)",
        assignment_id,
        assigned,
        changed.len()
    );
    Ok(assigned)
}

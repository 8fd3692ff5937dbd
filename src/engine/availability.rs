use ulid::Ulid;

use crate::limits::MAX_UPCOMING;
use crate::model::*;

use super::conflict::{now_ms, validate_instant, validate_span, validate_window};
use super::{Engine, EngineError};

// ── Interval algebra ─────────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `window` minus the union of `busy` (sorted by start, may overlap).
pub fn free_within(window: &Span, busy: &[Span]) -> Vec<Span> {
    let mut free = Vec::new();
    let mut cursor = window.start;
    for b in merge_overlapping(busy) {
        if b.end <= cursor {
            continue;
        }
        if b.start >= window.end {
            break;
        }
        if b.start > cursor {
            free.push(Span::new(cursor, b.start));
        }
        cursor = cursor.max(b.end);
    }
    if cursor < window.end {
        free.push(Span::new(cursor, window.end));
    }
    free
}

/// True if the room can take a reservation for exactly `window`. This is the
/// write-path conflict predicate, so a room reported free always accepts the
/// booking (absent a concurrent writer) and vice versa.
fn is_free(rs: &RoomState, window: &Span) -> bool {
    rs.first_conflict(window, None).is_none()
}

impl Engine {
    /// Non-cancelled reservations of one room intersecting the window, by start.
    pub async fn agenda(
        &self,
        room_id: Ulid,
        window_start: Ms,
        window_end: Ms,
    ) -> Result<Vec<ReservationInfo>, EngineError> {
        let window = validate_window(window_start, window_end)?;
        let rs = self.room_state(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        if guard.deleted {
            return Err(EngineError::NotFound(room_id));
        }
        let now = now_ms();
        Ok(guard
            .overlapping(&window)
            .filter(|r| r.is_blocking())
            .map(|r| r.info(now))
            .collect())
    }

    /// Gaps in one room's timeline within the window.
    pub async fn free_slots(
        &self,
        room_id: Ulid,
        window_start: Ms,
        window_end: Ms,
    ) -> Result<Vec<Span>, EngineError> {
        let window = validate_window(window_start, window_end)?;
        let rs = self.room_state(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        if guard.deleted {
            return Err(EngineError::NotFound(room_id));
        }
        let busy: Vec<Span> = guard
            .overlapping(&window)
            .filter(|r| r.is_blocking())
            .map(|r| r.span)
            .collect();
        Ok(free_within(&window, &busy))
    }

    /// Active rooms with enough capacity and no blocking reservation in the
    /// window, ordered by name. The window must be one a booking could cover.
    pub async fn available_rooms(
        &self,
        window_start: Ms,
        window_end: Ms,
        min_capacity: u32,
    ) -> Result<Vec<Room>, EngineError> {
        let window = validate_span(window_start, window_end)?;
        let mut rooms = Vec::new();
        for rs in self.room_handles() {
            let guard = rs.read().await;
            if guard.deleted || !guard.room.active || guard.room.capacity < min_capacity {
                continue;
            }
            if is_free(&guard, &window) {
                rooms.push(guard.room.clone());
            }
        }
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rooms)
    }

    /// Active rooms at an instant, split into occupied and free.
    pub async fn occupancy_snapshot(&self, at: Ms) -> Result<Occupancy, EngineError> {
        let at = validate_instant(at)?;
        let mut total_rooms = 0;
        let mut occupied_rooms = 0;
        for rs in self.room_handles() {
            let guard = rs.read().await;
            if guard.deleted || !guard.room.active {
                continue;
            }
            total_rooms += 1;
            if guard.occupied_at(at) {
                occupied_rooms += 1;
            }
        }
        Ok(Occupancy {
            at,
            total_rooms,
            occupied_rooms,
            free_rooms: total_rooms - occupied_rooms,
        })
    }

    /// Per-user summary: occupancy now, today's bookings, next scheduled ones.
    pub async fn dashboard(
        &self,
        owner: &str,
        at: Ms,
        upcoming_limit: usize,
    ) -> Result<Dashboard, EngineError> {
        let at = validate_instant(at)?;
        let today = Span::day_of(at);
        let limit = upcoming_limit.min(MAX_UPCOMING);
        let now = now_ms();

        let mut reservations_today = 0;
        let mut upcoming: Vec<ReservationInfo> = Vec::new();
        for rs in self.room_handles() {
            let guard = rs.read().await;
            for r in guard.reservations.iter().filter(|r| r.owner == owner && r.is_blocking()) {
                if today.contains_instant(r.span.start) {
                    reservations_today += 1;
                }
                if r.span.start > at && r.status_at(now) == ReservationStatus::Scheduled {
                    upcoming.push(r.info(now));
                }
            }
        }
        upcoming.sort_by_key(|r| (r.start, r.id));
        upcoming.truncate(limit);

        Ok(Dashboard {
            occupancy: self.occupancy_snapshot(at).await?,
            reservations_today,
            upcoming,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![Span::new(0, 10), Span::new(5, 15), Span::new(20, 30)];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(0, 15), Span::new(20, 30)]
        );
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(0, 10), Span::new(10, 20)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(0, 20)]);
    }

    #[test]
    fn free_within_empty_timeline() {
        assert_eq!(free_within(&Span::new(0, 100), &[]), vec![Span::new(0, 100)]);
    }

    #[test]
    fn free_within_middle_punch() {
        assert_eq!(
            free_within(&Span::new(0, 100), &[Span::new(40, 60)]),
            vec![Span::new(0, 40), Span::new(60, 100)]
        );
    }

    #[test]
    fn free_within_busy_spills_over_edges() {
        let busy = vec![Span::new(-10, 20), Span::new(90, 150)];
        assert_eq!(
            free_within(&Span::new(0, 100), &busy),
            vec![Span::new(20, 90)]
        );
    }

    #[test]
    fn free_within_fully_booked() {
        let busy = vec![Span::new(0, 50), Span::new(50, 100)];
        assert!(free_within(&Span::new(0, 100), &busy).is_empty());
    }

    #[test]
    fn free_within_overlapping_busy() {
        let busy = vec![Span::new(10, 30), Span::new(20, 40), Span::new(70, 80)];
        assert_eq!(
            free_within(&Span::new(0, 100), &busy),
            vec![Span::new(0, 10), Span::new(40, 70), Span::new(80, 100)]
        );
    }
}

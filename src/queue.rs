//! Queue planning utils.
//!
//! Requested queue groups ([`QueueRequest`]) are packed onto a device's queue
//! families by [`match_queue_families`]. A feasible match becomes a
//! [`QueuePlan`], which yields the per-family creation requests handed to
//! device creation and later resolves the created queues in a fixed order.
use crate::BoilerSmallVec;
use ash::{vk, Device};
use std::{ops::Range, os::raw::c_float};
use thiserror::Error;

/// A queue family of a physical device.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct QueueFamily {
    /// Index of the queue family, as reported by the driver.
    pub index: u32,
    /// The kinds of work queues of this family can execute.
    pub flags: vk::QueueFlags,
    /// Amount of queues in this family.
    pub queue_count: u32,
}

impl QueueFamily {
    /// Create a new queue family description.
    #[inline]
    pub fn new(index: u32, flags: vk::QueueFlags, queue_count: u32) -> QueueFamily {
        QueueFamily {
            index,
            flags,
            queue_count,
        }
    }

    /// Convert the driver's queue family list, keeping the reported order.
    pub fn from_properties(properties: &[vk::QueueFamilyProperties]) -> Vec<QueueFamily> {
        properties
            .iter()
            .enumerate()
            .map(|(i, properties)| {
                QueueFamily::new(i as u32, properties.queue_flags, properties.queue_count)
            })
            .collect()
    }
}

/// A group of queues the application wants.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct QueueRequest {
    /// A queue family may serve this request if it supports
    /// **any** of these flags.
    pub flags: vk::QueueFlags,
    /// Amount of queues wanted.
    pub count: u32,
}

impl QueueRequest {
    /// Request `count` queues from families sharing any of `flags`.
    #[inline]
    pub fn new(flags: vk::QueueFlags, count: u32) -> QueueRequest {
        QueueRequest { flags, count }
    }

    /// Request `count` graphics queues.
    #[inline]
    pub fn graphics(count: u32) -> QueueRequest {
        QueueRequest::new(vk::QueueFlags::GRAPHICS, count)
    }

    /// Request `count` compute queues.
    #[inline]
    pub fn compute(count: u32) -> QueueRequest {
        QueueRequest::new(vk::QueueFlags::COMPUTE, count)
    }

    /// Request `count` transfer queues.
    #[inline]
    pub fn transfer(count: u32) -> QueueRequest {
        QueueRequest::new(vk::QueueFlags::TRANSFER, count)
    }

    /// Returns true if queues of `family` may be used for this request.
    #[inline]
    pub fn is_served_by(&self, family: &QueueFamily) -> bool {
        self.flags.intersects(family.flags)
    }
}

/// A contiguous range of queues within one family, given to one request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct QueueAssignment {
    /// Position of the request in the requested order.
    pub request_index: usize,
    /// Index of the queue family the queues are taken from.
    pub family_index: u32,
    /// Index of the first queue within the family.
    pub first_queue: u32,
    /// Amount of queues.
    pub count: u32,
}

impl QueueAssignment {
    /// Indices of the assigned queues within the family.
    #[inline]
    pub fn queue_indices(&self) -> Range<u32> {
        self.first_queue..self.first_queue + self.count
    }
}

/// Result of [`match_queue_families`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMatch {
    assignments: Vec<QueueAssignment>,
    consumed: BoilerSmallVec<(u32, u32)>,
    remaining: BoilerSmallVec<u32>,
}

impl QueueMatch {
    /// Every request got all the queues it asked for.
    #[inline]
    pub fn is_feasible(&self) -> bool {
        self.remaining.iter().all(|&remaining| remaining == 0)
    }

    /// Assignments in the order they were made: family by family, and
    /// request by request within a family.
    #[inline]
    pub fn assignments(&self) -> &[QueueAssignment] {
        &self.assignments
    }

    /// `(family_index, queue_count)` for every family queues were taken from.
    #[inline]
    pub fn consumed(&self) -> &[(u32, u32)] {
        &self.consumed
    }

    /// Queues each request is still missing, in request order.
    #[inline]
    pub fn remaining(&self) -> &[u32] {
        &self.remaining
    }
}

/// Pack `requests` onto `families`.
///
/// First-fit and single pass: families are visited in the given order, and
/// within a family the requests are served in the given order, each taking
/// as many of the family's remaining queues as it still needs. There is no
/// backtracking, so a request listed first may use up a family a later
/// request depended on, making the match infeasible even though another
/// order would succeed.
pub fn match_queue_families(families: &[QueueFamily], requests: &[QueueRequest]) -> QueueMatch {
    let mut remaining: BoilerSmallVec<u32> = requests.iter().map(|request| request.count).collect();
    let mut assignments = Vec::new();
    let mut consumed = BoilerSmallVec::new();

    for family in families {
        let mut capacity = family.queue_count;
        if capacity == 0 {
            continue;
        }

        for (request_index, request) in requests.iter().enumerate() {
            if capacity == 0 {
                break;
            }

            let wanted = remaining[request_index];
            if wanted == 0 || !request.is_served_by(family) {
                continue;
            }

            let take = capacity.min(wanted);
            assignments.push(QueueAssignment {
                request_index,
                family_index: family.index,
                first_queue: family.queue_count - capacity,
                count: take,
            });

            capacity -= take;
            remaining[request_index] -= take;
        }

        let used = family.queue_count - capacity;
        if used > 0 {
            consumed.push((family.index, used));
        }
    }

    QueueMatch {
        assignments,
        consumed,
        remaining,
    }
}

/// The queue requests could not all be satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("queue requests could not be satisfied (missing queues per request: {remaining:?})")]
pub struct QueueShortfall {
    /// Queues each request is still missing, in request order.
    pub remaining: BoilerSmallVec<u32>,
}

/// Amount of queues to create from one queue family.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct QueueCreationRequest {
    /// Index of the queue family.
    pub family_index: u32,
    /// Amount of queues to create.
    pub queue_count: u32,
}

impl QueueCreationRequest {
    #[inline]
    fn as_vulkan<'a>(&self, priorities: &'a [c_float]) -> vk::DeviceQueueCreateInfoBuilder<'a> {
        vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(self.family_index)
            .queue_priorities(&priorities[..self.queue_count as usize])
    }
}

/// Where every requested queue lives, and what to create to get them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePlan {
    request_count: usize,
    assignments: Vec<QueueAssignment>,
    creation_requests: BoilerSmallVec<QueueCreationRequest>,
}

impl QueuePlan {
    /// Match `requests` against `families` and keep the result if it is
    /// feasible.
    pub fn new(
        families: &[QueueFamily],
        requests: &[QueueRequest],
    ) -> Result<QueuePlan, QueueShortfall> {
        let queue_match = match_queue_families(families, requests);
        if !queue_match.is_feasible() {
            return Err(QueueShortfall {
                remaining: queue_match.remaining,
            });
        }

        let mut creation_requests: BoilerSmallVec<_> = queue_match
            .consumed
            .iter()
            .map(|&(family_index, queue_count)| QueueCreationRequest {
                family_index,
                queue_count,
            })
            .collect();
        creation_requests.sort_by_key(|request| request.family_index);

        Ok(QueuePlan {
            request_count: requests.len(),
            assignments: queue_match.assignments,
            creation_requests,
        })
    }

    /// Amount of queue requests this plan was made for.
    #[inline]
    pub fn request_count(&self) -> usize {
        self.request_count
    }

    /// All assignments, in the order they were made.
    #[inline]
    pub fn assignments(&self) -> &[QueueAssignment] {
        &self.assignments
    }

    /// The assignments belonging to the request at `request_index`.
    pub fn assignments_for(&self, request_index: usize) -> impl Iterator<Item = &QueueAssignment> {
        self.assignments
            .iter()
            .filter(move |assignment| assignment.request_index == request_index)
    }

    /// One entry per used queue family, ordered by family index.
    #[inline]
    pub fn creation_requests(&self) -> &[QueueCreationRequest] {
        &self.creation_requests
    }

    /// Amount of queues created over all families.
    pub fn total_queue_count(&self) -> u32 {
        self.creation_requests
            .iter()
            .map(|request| request.queue_count)
            .sum()
    }

    /// The largest amount of queues created from a single family.
    pub fn max_queue_count(&self) -> u32 {
        self.creation_requests
            .iter()
            .map(|request| request.queue_count)
            .max()
            .unwrap_or(0)
    }

    /// A priority array large enough for every creation request, with
    /// `priority` for every queue.
    pub fn uniform_priorities(&self, priority: c_float) -> Vec<c_float> {
        vec![priority; self.max_queue_count() as usize]
    }

    /// Queue create infos pointing into `priorities`, which has to outlive
    /// them. Every info uses the leading entries of `priorities`.
    ///
    /// # Panics
    ///
    /// Panics if `priorities` is shorter than
    /// [`max_queue_count`](Self::max_queue_count).
    pub fn queue_create_infos(
        &self,
        priorities: &[c_float],
    ) -> BoilerSmallVec<vk::DeviceQueueCreateInfo> {
        assert!(
            priorities.len() >= self.max_queue_count() as usize,
            "{} queue priorities given, {} needed",
            priorities.len(),
            self.max_queue_count()
        );
        self.creation_requests
            .iter()
            .map(|request| request.as_vulkan(priorities).build())
            .collect()
    }

    /// Fetch the planned queues from the created device.
    /// See [`resolve_queues`].
    #[inline]
    pub unsafe fn resolve(&self, source: &impl QueueSource) -> QueueHandles {
        resolve_queues(source, self.request_count, &self.assignments)
    }
}

/// Something queues can be fetched from, usually an [`ash::Device`].
pub trait QueueSource {
    /// Returns queue `queue_index` of family `family_index`.
    unsafe fn queue(&self, family_index: u32, queue_index: u32) -> vk::Queue;
}

impl QueueSource for Device {
    #[inline]
    unsafe fn queue(&self, family_index: u32, queue_index: u32) -> vk::Queue {
        self.get_device_queue(family_index, queue_index)
    }
}

/// Queue handles in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueHandles {
    handles: Vec<vk::Queue>,
    groups: BoilerSmallVec<Range<usize>>,
}

impl QueueHandles {
    /// Every handle: request by request, within a request assignment by
    /// assignment, within an assignment by queue index.
    #[inline]
    pub fn as_slice(&self) -> &[vk::Queue] {
        &self.handles
    }

    /// The handles belonging to the request at `request_index`.
    /// Empty if there is no such request.
    pub fn group(&self, request_index: usize) -> &[vk::Queue] {
        match self.groups.get(request_index) {
            Some(range) => &self.handles[range.clone()],
            None => &[],
        }
    }

    /// Amount of handles.
    #[inline]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns true if there are no handles.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Fetch one queue per assigned slot. Requests are walked in order; for
/// each request its assignments are walked in the order they were made,
/// and within an assignment the queue indices ascend.
pub unsafe fn resolve_queues(
    source: &impl QueueSource,
    request_count: usize,
    assignments: &[QueueAssignment],
) -> QueueHandles {
    let mut handles = Vec::with_capacity(assignments.iter().map(|a| a.count as usize).sum());
    let mut groups = BoilerSmallVec::with_capacity(request_count);

    for request_index in 0..request_count {
        let start = handles.len();
        for assignment in assignments
            .iter()
            .filter(|assignment| assignment.request_index == request_index)
        {
            for queue_index in assignment.queue_indices() {
                handles.push(source.queue(assignment.family_index, queue_index));
            }
        }

        groups.push(start..handles.len());
    }

    QueueHandles { handles, groups }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::cell::RefCell;

    const G: vk::QueueFlags = vk::QueueFlags::GRAPHICS;
    const C: vk::QueueFlags = vk::QueueFlags::COMPUTE;
    const T: vk::QueueFlags = vk::QueueFlags::TRANSFER;

    fn families(spec: &[(vk::QueueFlags, u32)]) -> Vec<QueueFamily> {
        spec.iter()
            .enumerate()
            .map(|(i, &(flags, count))| QueueFamily::new(i as u32, flags, count))
            .collect()
    }

    fn assignment(request_index: usize, family_index: u32, first_queue: u32, count: u32) -> QueueAssignment {
        QueueAssignment {
            request_index,
            family_index,
            first_queue,
            count,
        }
    }

    fn assert_bounds(families: &[QueueFamily], requests: &[QueueRequest], queue_match: &QueueMatch) {
        for family in families {
            let used: u32 = queue_match
                .assignments()
                .iter()
                .filter(|a| a.family_index == family.index)
                .map(|a| a.count)
                .sum();
            assert!(used <= family.queue_count, "family {} over capacity", family.index);
        }

        if queue_match.is_feasible() {
            for (i, request) in requests.iter().enumerate() {
                let got: u32 = queue_match
                    .assignments()
                    .iter()
                    .filter(|a| a.request_index == i)
                    .map(|a| a.count)
                    .sum();
                assert_eq!(got, request.count, "request {i} not conserved");
            }
        }
    }

    #[derive(Default)]
    struct RecordingDevice {
        calls: RefCell<Vec<(u32, u32)>>,
    }

    impl QueueSource for RecordingDevice {
        unsafe fn queue(&self, family_index: u32, queue_index: u32) -> vk::Queue {
            self.calls.borrow_mut().push((family_index, queue_index));
            vk::Queue::from_raw(((family_index as u64) << 32) | (queue_index as u64 + 1))
        }
    }

    #[test]
    fn packs_across_families() {
        let families = families(&[(G | C, 2), (C, 4), (T, 1)]);
        let requests = [QueueRequest::new(G | C, 2), QueueRequest::compute(3)];

        let queue_match = match_queue_families(&families, &requests);
        assert!(queue_match.is_feasible());
        assert_eq!(
            queue_match.assignments(),
            &[assignment(0, 0, 0, 2), assignment(1, 1, 0, 3)]
        );

        let plan = QueuePlan::new(&families, &requests).unwrap();
        assert_eq!(
            plan.creation_requests(),
            &[
                QueueCreationRequest {
                    family_index: 0,
                    queue_count: 2
                },
                QueueCreationRequest {
                    family_index: 1,
                    queue_count: 3
                },
            ]
        );
        assert_eq!(plan.total_queue_count(), 5);
        assert_eq!(plan.max_queue_count(), 3);
    }

    #[test]
    fn no_family_with_required_flags() {
        let families = families(&[(C, 2)]);
        let requests = [QueueRequest::graphics(1)];

        let queue_match = match_queue_families(&families, &requests);
        assert!(!queue_match.is_feasible());
        assert_eq!(queue_match.remaining(), &[1]);
        assert!(queue_match.assignments().is_empty());
        assert!(queue_match.consumed().is_empty());

        let shortfall = QueuePlan::new(&families, &requests).unwrap_err();
        assert_eq!(shortfall.remaining.as_slice(), &[1]);
    }

    #[test]
    fn request_order_decides_feasibility() {
        let families = families(&[(G | C, 1)]);

        let queue_match = match_queue_families(&families, &[QueueRequest::graphics(1), QueueRequest::compute(1)]);
        assert!(!queue_match.is_feasible());
        assert_eq!(queue_match.assignments(), &[assignment(0, 0, 0, 1)]);
        assert_eq!(queue_match.remaining(), &[0, 1]);

        // The broad request comes first and takes the only graphics queue.
        let families = self::families(&[(G, 1), (C, 1)]);
        let broad_first = [QueueRequest::new(G | C, 1), QueueRequest::graphics(1)];
        let queue_match = match_queue_families(&families, &broad_first);
        assert!(!queue_match.is_feasible());
        assert_eq!(queue_match.remaining(), &[0, 1]);

        let narrow_first = [QueueRequest::graphics(1), QueueRequest::new(G | C, 1)];
        let queue_match = match_queue_families(&families, &narrow_first);
        assert!(queue_match.is_feasible());
        assert_eq!(
            queue_match.assignments(),
            &[assignment(0, 0, 0, 1), assignment(1, 1, 0, 1)]
        );
    }

    #[test]
    fn family_order_decides_feasibility() {
        let requests = [QueueRequest::new(G | C, 1), QueueRequest::graphics(1)];

        let graphics_first = families(&[(G, 1), (C, 1)]);
        assert!(!match_queue_families(&graphics_first, &requests).is_feasible());

        let compute_first = families(&[(C, 1), (G, 1)]);
        let queue_match = match_queue_families(&compute_first, &requests);
        assert!(queue_match.is_feasible());
        assert_eq!(
            queue_match.assignments(),
            &[assignment(0, 0, 0, 1), assignment(1, 1, 0, 1)]
        );
    }

    #[test]
    fn request_split_across_families() {
        let families = families(&[(C, 1), (G, 3), (C, 2)]);
        let requests = [QueueRequest::compute(3)];

        let plan = QueuePlan::new(&families, &requests).unwrap();
        assert_eq!(
            plan.assignments(),
            &[assignment(0, 0, 0, 1), assignment(0, 2, 0, 2)]
        );
        assert_eq!(plan.assignments_for(0).count(), 2);
        assert_eq!(
            plan.creation_requests()
                .iter()
                .map(|r| (r.family_index, r.queue_count))
                .collect::<Vec<_>>(),
            vec![(0, 1), (2, 2)]
        );
    }

    #[test]
    fn requests_share_a_family_with_disjoint_ranges() {
        let families = families(&[(G | C | T, 4)]);
        let requests = [
            QueueRequest::graphics(1),
            QueueRequest::compute(2),
            QueueRequest::transfer(1),
        ];

        let plan = QueuePlan::new(&families, &requests).unwrap();
        assert_eq!(
            plan.assignments(),
            &[
                assignment(0, 0, 0, 1),
                assignment(1, 0, 1, 2),
                assignment(2, 0, 3, 1),
            ]
        );
        assert_eq!(plan.creation_requests().len(), 1);
        assert_eq!(plan.creation_requests()[0].queue_count, 4);
    }

    #[test]
    fn empty_families_are_skipped() {
        let families = families(&[(G, 0), (G, 1)]);
        let queue_match = match_queue_families(&families, &[QueueRequest::graphics(1)]);
        assert_eq!(queue_match.assignments(), &[assignment(0, 1, 0, 1)]);
        assert_eq!(queue_match.consumed(), &[(1, 1)]);
    }

    #[test]
    fn zero_count_requests_get_nothing() {
        let families = families(&[(G, 2)]);
        let plan = QueuePlan::new(&families, &[QueueRequest::graphics(0)]).unwrap();
        assert!(plan.assignments().is_empty());
        assert!(plan.creation_requests().is_empty());
        assert_eq!(plan.max_queue_count(), 0);
    }

    #[test]
    fn matching_is_deterministic() {
        let families = families(&[(G | C, 2), (C, 1), (T | C, 3)]);
        let requests = [
            QueueRequest::compute(2),
            QueueRequest::new(T, 2),
            QueueRequest::new(G | C, 1),
        ];

        let first = match_queue_families(&families, &requests);
        let second = match_queue_families(&families, &requests);
        assert_eq!(first, second);
    }

    #[test]
    fn conservation_and_capacity_hold() {
        let masks = [G, C, G | C, T, C | T];
        for &(first, second) in &[(0usize, 1usize), (2, 3), (4, 0), (2, 2)] {
            for first_count in 0..=3 {
                for second_count in 0..=3 {
                    let families = families(&[(masks[first], first_count), (masks[second], second_count), (T, 1)]);
                    for &(a, b) in &[(G, C), (G | C, T), (C | T, G)] {
                        for wanted in 0..=4 {
                            let requests = [QueueRequest::new(a, wanted), QueueRequest::new(b, 1)];
                            let queue_match = match_queue_families(&families, &requests);
                            assert_bounds(&families, &requests, &queue_match);

                            for (i, request) in requests.iter().enumerate() {
                                let reachable: u32 = families
                                    .iter()
                                    .filter(|family| request.is_served_by(family))
                                    .map(|family| family.queue_count)
                                    .sum();
                                if reachable < request.count {
                                    assert!(!queue_match.is_feasible());
                                    assert!(queue_match.remaining()[i] > 0);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn create_infos_share_priorities() {
        let families = families(&[(G, 1), (C, 3)]);
        let plan = QueuePlan::new(
            &families,
            &[QueueRequest::graphics(1), QueueRequest::compute(3)],
        )
        .unwrap();

        let priorities = plan.uniform_priorities(0.5);
        assert_eq!(priorities, vec![0.5; 3]);

        let infos = plan.queue_create_infos(&priorities);
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].queue_family_index, 0);
        assert_eq!(infos[0].queue_count, 1);
        assert_eq!(infos[1].queue_family_index, 1);
        assert_eq!(infos[1].queue_count, 3);
        assert_eq!(infos[1].p_queue_priorities, priorities.as_ptr());
    }

    #[test]
    #[should_panic(expected = "1 queue priorities given, 3 needed")]
    fn create_infos_reject_short_priorities() {
        let families = families(&[(C, 3)]);
        let plan = QueuePlan::new(&families, &[QueueRequest::compute(3)]).unwrap();

        plan.queue_create_infos(&[1.0]);
    }

    #[test]
    fn resolves_in_request_then_assignment_then_index_order() {
        let families = families(&[(G, 1), (C, 2), (G | C, 2)]);
        let requests = [QueueRequest::compute(3), QueueRequest::graphics(2)];

        let plan = QueuePlan::new(&families, &requests).unwrap();
        assert_eq!(
            plan.assignments(),
            &[
                assignment(1, 0, 0, 1),
                assignment(0, 1, 0, 2),
                assignment(0, 2, 0, 1),
                assignment(1, 2, 1, 1),
            ]
        );

        let device = RecordingDevice::default();
        let handles = unsafe { plan.resolve(&device) };
        assert_eq!(
            device.calls.borrow().as_slice(),
            &[(1, 0), (1, 1), (2, 0), (0, 0), (2, 1)]
        );
        assert_eq!(handles.len(), 5);
        assert_eq!(handles.group(0).len(), 3);
        assert_eq!(handles.group(1), &handles.as_slice()[3..]);
        assert_eq!(handles.group(1)[0], vk::Queue::from_raw(1));
        assert!(handles.group(2).is_empty());
    }

    #[test]
    fn resolving_nothing_fetches_nothing() {
        let device = RecordingDevice::default();
        let handles = unsafe { resolve_queues(&device, 2, &[]) };
        assert!(handles.is_empty());
        assert!(handles.group(0).is_empty());
        assert!(device.calls.borrow().is_empty());
    }
}

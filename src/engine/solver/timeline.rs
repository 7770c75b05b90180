// ==========================================
// 维修准备排产系统 - 资源时间线
// ==========================================
// 职责: 独占槽位 no-overlap (含异地切换缓冲) 与累积槽位容量检查
// ==========================================

use crate::engine::model::{Demand, Minutes, ResourceSlot, ScheduleModel, SlotKind};

#[derive(Debug, Clone)]
struct Busy {
    start: Minutes,
    end: Minutes,
    quantity: u32,
    location: Option<usize>,
}

/// 单槽位占用时间线
#[derive(Debug, Clone)]
pub struct SlotTimeline {
    kind: SlotKind,
    busy: Vec<Busy>,
}

impl SlotTimeline {
    pub fn new(slot: &ResourceSlot) -> Self {
        Self {
            kind: slot.kind,
            busy: Vec::new(),
        }
    }

    pub fn reserve(&mut self, start: Minutes, end: Minutes, quantity: u32, location: Option<usize>) {
        if end <= start {
            return;
        }
        let pos = self.busy.partition_point(|b| b.start <= start);
        self.busy.insert(pos, Busy { start, end, quantity, location });
    }

    /// 从 from 起最早可放置 duration 的时刻; 需求超出容量时返回 None
    pub fn earliest_fit(
        &self,
        from: Minutes,
        duration: Minutes,
        quantity: u32,
        location: Option<usize>,
        switch_buffer: Minutes,
    ) -> Option<Minutes> {
        match self.kind {
            SlotKind::Exclusive => Some(self.earliest_exclusive(from, duration, location, switch_buffer)),
            SlotKind::Cumulative { capacity } => self.earliest_cumulative(from, duration, quantity, capacity),
        }
    }

    fn earliest_exclusive(
        &self,
        from: Minutes,
        duration: Minutes,
        location: Option<usize>,
        switch_buffer: Minutes,
    ) -> Minutes {
        let mut t = from;
        'scan: loop {
            for b in &self.busy {
                let gap = match (b.location, location) {
                    (Some(a), Some(c)) if a != c => switch_buffer,
                    _ => 0,
                };
                if b.start < t + duration + gap && t < b.end + gap {
                    t = b.end + gap;
                    continue 'scan;
                }
            }
            return t;
        }
    }

    fn earliest_cumulative(
        &self,
        from: Minutes,
        duration: Minutes,
        quantity: u32,
        capacity: u32,
    ) -> Option<Minutes> {
        if quantity > capacity {
            return None;
        }
        let mut t = from;
        loop {
            let mut check_points = vec![t];
            check_points.extend(
                self.busy
                    .iter()
                    .filter(|b| b.start > t && b.start < t + duration)
                    .map(|b| b.start),
            );
            let overloaded = check_points.into_iter().find(|&p| self.load_at(p) + quantity > capacity);
            match overloaded {
                None => return Some(t),
                Some(p) => {
                    // 跳到该时刻最早释放的占用结束处
                    let next = self
                        .busy
                        .iter()
                        .filter(|b| b.start <= p && p < b.end)
                        .map(|b| b.end)
                        .min()?;
                    t = next.max(t + 1);
                }
            }
        }
    }

    fn load_at(&self, at: Minutes) -> u32 {
        self.busy
            .iter()
            .filter(|b| b.start <= at && at < b.end)
            .map(|b| b.quantity)
            .sum()
    }
}

/// 全部槽位的时间线 (初始含固定占用)
#[derive(Debug, Clone)]
pub struct Timelines {
    slots: Vec<SlotTimeline>,
}

impl Timelines {
    pub fn from_model(model: &ScheduleModel) -> Self {
        let mut slots: Vec<SlotTimeline> = model.slots.iter().map(SlotTimeline::new).collect();
        for occ in &model.fixed {
            slots[occ.slot].reserve(occ.start, occ.end, occ.quantity, occ.location);
        }
        Self { slots }
    }

    /// 所有需求同时满足的最早时刻
    pub fn earliest_start(
        &self,
        demands: &[Demand],
        from: Minutes,
        duration: Minutes,
        location: Option<usize>,
        switch_buffer: Minutes,
    ) -> Option<Minutes> {
        if duration <= 0 || demands.is_empty() {
            return Some(from);
        }
        let mut t = from;
        loop {
            let mut latest = t;
            for d in demands {
                let fit = self.slots[d.slot].earliest_fit(t, duration, d.quantity, location, switch_buffer)?;
                latest = latest.max(fit);
            }
            if latest == t {
                return Some(t);
            }
            t = latest;
        }
    }

    pub fn reserve(&mut self, demands: &[Demand], start: Minutes, end: Minutes, location: Option<usize>) {
        for d in demands {
            self.slots[d.slot].reserve(start, end, d.quantity, location);
        }
    }
}

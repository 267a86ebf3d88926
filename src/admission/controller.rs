//! 准入 / 去重控制器
//!
//! 维护一张有上限、带时间窗口的指纹历史表；每个调用在执行前得到 AdmissionDecision：
//! 1. 指纹命中、已完成、可缓存且仍在窗口内 -> 返回缓存结果
//! 2. 指纹命中且仍在执行 -> 拦截（DUPLICATE_ACTION_BLOCKED）
//! 3. 同名、不同参、同一 contextKey、近期调用过且动作敏感 -> 需要确认
//! 4. 其余 -> 放行，并在同一临界区内记为 in-flight

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

use crate::actions::{ActionCall, ActionDefinition, ActionResult};
use crate::admission::Fingerprint;
use crate::config::AdmissionSection;

/// 拦截原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockReason {
    DuplicateActionBlocked,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::DuplicateActionBlocked => "DUPLICATE_ACTION_BLOCKED",
        }
    }
}

/// 准入结论（在任何处理器副作用之前得出）
#[derive(Debug, Clone)]
pub enum AdmissionDecision {
    /// 放行；指纹已记为 in-flight
    Execute { fingerprint: Fingerprint },
    /// 直接返回缓存结果
    Cached {
        result: ActionResult,
        conflicting_call_id: String,
    },
    Blocked {
        reason: BlockReason,
        conflicting_call_id: String,
    },
    /// 交给调用方确认后重发（params.confirmed="true"）
    ConfirmRequired { conflicting_call_id: String },
}

impl AdmissionDecision {
    pub fn should_execute(&self) -> bool {
        matches!(self, AdmissionDecision::Execute { .. })
    }

    pub fn cached_result(&self) -> Option<&ActionResult> {
        match self {
            AdmissionDecision::Cached { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn allow_with_confirmation(&self) -> bool {
        matches!(self, AdmissionDecision::ConfirmRequired { .. })
    }

    pub fn block_reason(&self) -> Option<BlockReason> {
        match self {
            AdmissionDecision::Blocked { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    pub fn conflicting_call_id(&self) -> Option<&str> {
        match self {
            AdmissionDecision::Execute { .. } => None,
            AdmissionDecision::Cached {
                conflicting_call_id,
                ..
            }
            | AdmissionDecision::Blocked {
                conflicting_call_id,
                ..
            }
            | AdmissionDecision::ConfirmRequired {
                conflicting_call_id,
            } => Some(conflicting_call_id),
        }
    }

    /// 非放行结论对应的结构化结果数据（可审计，不是静默丢弃）
    pub fn rejection_data(&self) -> Option<Value> {
        match self {
            AdmissionDecision::Execute { .. } | AdmissionDecision::Cached { .. } => None,
            AdmissionDecision::Blocked {
                reason,
                conflicting_call_id,
            } => Some(json!({
                "status": "blocked",
                "reason": reason.as_str(),
                "conflictingCallId": conflicting_call_id,
            })),
            AdmissionDecision::ConfirmRequired {
                conflicting_call_id,
            } => Some(json!({
                "status": "confirmation_required",
                "allowWithConfirmation": true,
                "conflictingCallId": conflicting_call_id,
                "hint": "re-issue the call with confirmed=\"true\" to proceed",
            })),
        }
    }
}

#[derive(Debug, Clone)]
enum EntryState {
    InFlight,
    Completed { result: ActionResult, ok: bool },
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    action: String,
    context_key: Option<String>,
    call_id: String,
    cacheable: bool,
    state: EntryState,
    /// 放行时刻；完成后更新为完成时刻
    touched_at: Instant,
}

impl HistoryEntry {
    fn is_in_flight(&self) -> bool {
        matches!(self.state, EntryState::InFlight)
    }
}

/// 窗口与上限
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    /// 已完成结果的缓存窗口
    pub window: Duration,
    /// 敏感动作的近似重复确认窗口
    pub confirm_window: Duration,
    pub max_entries: usize,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(5),
            confirm_window: Duration::from_secs(30),
            max_entries: 1024,
        }
    }
}

impl From<&AdmissionSection> for AdmissionPolicy {
    fn from(section: &AdmissionSection) -> Self {
        Self {
            window: Duration::from_millis(section.window_ms),
            confirm_window: Duration::from_millis(section.confirm_window_ms),
            max_entries: section.max_entries.max(1),
        }
    }
}

/// 进程级共享的准入控制器；决策与登记在同一把锁内完成
#[derive(Debug)]
pub struct AdmissionController {
    policy: AdmissionPolicy,
    history: Mutex<HashMap<Fingerprint, HistoryEntry>>,
}

impl AdmissionController {
    pub fn new(policy: AdmissionPolicy) -> Self {
        Self {
            policy,
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    pub fn should_execute(
        &self,
        action: &ActionDefinition,
        call: &ActionCall,
        args: &Value,
    ) -> AdmissionDecision {
        let context_key = call.context_key();
        let fingerprint = Fingerprint::compute(&action.name, args, context_key);
        let now = Instant::now();
        let mut history = self.history.lock();

        self.collect_expired(&mut history, now);

        if let Some(entry) = history.get(&fingerprint) {
            match &entry.state {
                EntryState::InFlight => {
                    tracing::debug!(action = %action.name, %fingerprint, "Duplicate in-flight call blocked");
                    return AdmissionDecision::Blocked {
                        reason: BlockReason::DuplicateActionBlocked,
                        conflicting_call_id: entry.call_id.clone(),
                    };
                }
                EntryState::Completed { result, ok } => {
                    if *ok
                        && action.cacheable
                        && now.duration_since(entry.touched_at) <= self.policy.window
                    {
                        tracing::debug!(action = %action.name, %fingerprint, "Serving cached result");
                        return AdmissionDecision::Cached {
                            result: result.reissue_for(call),
                            conflicting_call_id: entry.call_id.clone(),
                        };
                    }
                }
            }
        }

        if action.sensitive && !call.params.is_confirmed() {
            let recent = history.iter().find(|(fp, entry)| {
                **fp != fingerprint
                    && entry.action == action.name
                    && entry.context_key.as_deref() == context_key
                    && now.duration_since(entry.touched_at) <= self.policy.confirm_window
            });
            if let Some((_, entry)) = recent {
                tracing::debug!(action = %action.name, conflicting = %entry.call_id, "Near-duplicate of sensitive action needs confirmation");
                return AdmissionDecision::ConfirmRequired {
                    conflicting_call_id: entry.call_id.clone(),
                };
            }
        }

        history.insert(
            fingerprint.clone(),
            HistoryEntry {
                action: action.name.clone(),
                context_key: context_key.map(str::to_string),
                call_id: call.id.clone(),
                cacheable: action.cacheable,
                state: EntryState::InFlight,
                touched_at: now,
            },
        );
        self.enforce_capacity(&mut history);

        AdmissionDecision::Execute { fingerprint }
    }

    /// 任务结束（成功或失败）后登记结果
    pub fn complete(&self, fingerprint: &Fingerprint, result: &ActionResult, ok: bool) {
        let mut history = self.history.lock();
        if let Some(entry) = history.get_mut(fingerprint) {
            entry.state = EntryState::Completed {
                result: result.clone(),
                ok,
            };
            entry.touched_at = Instant::now();
        }
    }

    pub fn len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 已完成且超出两个窗口的条目惰性回收；in-flight 不按时间回收
    fn collect_expired(&self, history: &mut HashMap<Fingerprint, HistoryEntry>, now: Instant) {
        let keep_for = self.policy.window.max(self.policy.confirm_window);
        history.retain(|_, entry| {
            entry.is_in_flight() || now.duration_since(entry.touched_at) <= keep_for
        });
    }

    /// 超出上限时优先淘汰最旧的已完成条目（不可缓存的先走）
    fn enforce_capacity(&self, history: &mut HashMap<Fingerprint, HistoryEntry>) {
        while history.len() > self.policy.max_entries {
            let victim = history
                .iter()
                .filter(|(_, e)| !e.is_in_flight())
                .min_by_key(|(_, e)| (e.cacheable, e.touched_at))
                .map(|(fp, _)| fp.clone());
            match victim {
                Some(fp) => {
                    history.remove(&fp);
                }
                None => {
                    tracing::warn!(
                        entries = history.len(),
                        max = self.policy.max_entries,
                        "Admission history full of in-flight calls; exceeding capacity"
                    );
                    break;
                }
            }
        }
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(AdmissionPolicy::default())
    }
}

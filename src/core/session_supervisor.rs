//! 会话监管：会话级取消令牌与当前轮次的子令牌
//!
//! 会话取消（关闭 Agent）会级联取消所有轮次；cancel_turn 只取消当前轮，排队中的任务不再启动。

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
    current_turn: Mutex<Option<CancellationToken>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            current_turn: Mutex::new(None),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 关闭会话
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 新一轮的子令牌（替换上一轮的）
    pub fn begin_turn(&self) -> CancellationToken {
        let token = self.cancel_token.child_token();
        *self.current_turn.lock() = Some(token.clone());
        token
    }

    /// 取消当前轮；没有进行中的轮次时返回 false
    pub fn cancel_turn(&self) -> bool {
        match self.current_turn.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

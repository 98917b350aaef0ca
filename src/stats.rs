//! 전송 통계

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::info;

/// 세션 단위 바이트/시간 카운터
///
/// 송신 태스크, 수신 태스크, 상태 출력 태스크가 동시에 접근한다
#[derive(Debug)]
pub struct SessionStats {
    /// 총 송신 바이트
    bytes_sent: AtomicU64,

    /// 총 수신 바이트
    bytes_received: AtomicU64,

    /// 송신 호출에 걸린 누적 시간 (나노초)
    sent_nanos: AtomicU64,

    /// 수신 호출에 걸린 누적 시간 (나노초)
    received_nanos: AtomicU64,

    /// 마지막 리셋 시간
    started_at: parking_lot::Mutex<Instant>,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            sent_nanos: AtomicU64::new(0),
            received_nanos: AtomicU64::new(0),
            started_at: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// 송신 기록
    pub fn record_sent(&self, bytes: usize, elapsed: Duration) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.sent_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// 수신 기록
    ///
    /// 첫 수신 전 대기 시간은 수신 시간에 포함하지 않는다
    pub fn record_received(&self, bytes: usize, elapsed: Duration) {
        let before = self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        if before > 0 {
            self.received_nanos
                .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn sent_time(&self) -> Duration {
        Duration::from_nanos(self.sent_nanos.load(Ordering::Relaxed))
    }

    pub fn received_time(&self) -> Duration {
        Duration::from_nanos(self.received_nanos.load(Ordering::Relaxed))
    }

    /// 통계 리셋 (연결 완료 시)
    pub fn reset(&self) {
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.sent_nanos.store(0, Ordering::Relaxed);
        self.received_nanos.store(0, Ordering::Relaxed);
        *self.started_at.lock() = Instant::now();
    }

    /// 현재 값 스냅샷
    pub fn snapshot(&self) -> TransferStats {
        TransferStats {
            elapsed: self.started_at.lock().elapsed(),
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
            sent_time: self.sent_time(),
            received_time: self.received_time(),
        }
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 통계 스냅샷
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    /// 리셋 이후 경과 시간
    pub elapsed: Duration,

    pub bytes_sent: u64,

    pub bytes_received: u64,

    /// 송신 호출 누적 시간
    pub sent_time: Duration,

    /// 수신 호출 누적 시간
    pub received_time: Duration,
}

impl TransferStats {
    /// 송신 속도 (bytes/sec), 측정 시간이 없으면 None
    pub fn send_rate(&self) -> Option<f64> {
        rate(self.bytes_sent, self.sent_time)
    }

    /// 수신 속도 (bytes/sec)
    pub fn receive_rate(&self) -> Option<f64> {
        rate(self.bytes_received, self.received_time)
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        let mut line = format!(
            "Elapsed: {:.2}s | Sent/Received: {}/{}",
            self.elapsed.as_secs_f64(),
            format_bytes(self.bytes_sent as f64),
            format_bytes(self.bytes_received as f64),
        );
        if let Some(rate) = self.send_rate() {
            line.push_str(&format!(" | Send: {}/s", format_bytes(rate)));
        }
        if let Some(rate) = self.receive_rate() {
            line.push_str(&format!(" | Receive: {}/s", format_bytes(rate)));
        }
        line
    }
}

fn rate(bytes: u64, time: Duration) -> Option<f64> {
    let secs = time.as_secs_f64();
    if secs == 0.0 {
        return None;
    }
    Some(bytes as f64 / secs)
}

/// 사람이 읽기 쉬운 크기 (1024 단위)
pub fn format_bytes(value: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut value = value;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let mut number = format!("{:.3}", value);
    while number.contains('.') && (number.ends_with('0') || number.ends_with('.')) {
        number.pop();
    }
    format!("{} {}", number, UNITS[unit])
}

/// 주기적으로 송수신 바이트를 출력하는 태스크
///
/// 반환된 핸들을 abort 하면 중지된다
pub fn spawn_status_reporter(stats: Arc<SessionStats>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            info!(
                "Sent/Received: {}/{}",
                format_bytes(stats.bytes_sent() as f64),
                format_bytes(stats.bytes_received() as f64)
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0.0), "0 B");
        assert_eq!(format_bytes(300.0), "300 B");
        assert_eq!(format_bytes(1536.0), "1.5 KB");
        assert_eq!(format_bytes(10.0 * 1024.0 * 1024.0), "10 MB");
    }

    #[test]
    fn test_received_time_skips_first_wait() {
        let stats = SessionStats::new();
        stats.record_received(128, Duration::from_secs(3));
        assert_eq!(stats.received_time(), Duration::ZERO);
        stats.record_received(128, Duration::from_millis(5));
        assert_eq!(stats.received_time(), Duration::from_millis(5));
        assert_eq!(stats.bytes_received(), 256);
    }

    #[test]
    fn test_reset() {
        let stats = SessionStats::new();
        stats.record_sent(4096, Duration::from_millis(2));
        assert_eq!(stats.bytes_sent(), 4096);
        assert!(stats.snapshot().send_rate().is_some());

        stats.reset();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bytes_sent, 0);
        assert!(snapshot.send_rate().is_none());
    }
}

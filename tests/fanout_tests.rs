use anyhow::Result;
use async_trait::async_trait;
use expf::error::ExpfError;
use expf::load::{start_load, FanoutOptions, LoadGenerator, RequestOverrides, ToolResult};
use expf::requests::RequestSpec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy)]
enum Behaviour {
    Succeed,
    Absent,
    Fail,
}

struct FakeGenerator {
    name: &'static str,
    behaviour: Behaviour,
    seen: Mutex<Vec<String>>,
    closed: AtomicUsize,
}

impl FakeGenerator {
    fn new(name: &'static str, behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            name,
            behaviour,
            seen: Mutex::new(Vec::new()),
            closed: AtomicUsize::new(0),
        })
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl LoadGenerator for FakeGenerator {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn start(&self, request: &RequestOverrides) -> expf::Result<ToolResult> {
        let path = request.path.clone().unwrap_or_default();
        self.seen.lock().unwrap().push(path.clone());
        match self.behaviour {
            Behaviour::Succeed => {
                let mut result = ToolResult::new(self.name, "GET", path);
                result.requests_per_second = Some(1000.0);
                Ok(result)
            }
            Behaviour::Absent => Err(ExpfError::ToolNotInstalled {
                executable: self.name.to_string(),
                cause: "not found".to_string(),
            }),
            Behaviour::Fail => Err(ExpfError::ToolExecutionFailed {
                executable: self.name.to_string(),
                code: Some(1),
                stdout: String::new(),
                stderr: "connection refused".to_string(),
            }),
        }
    }

    fn close(&self) -> expf::Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn dynamic(generator: &Arc<FakeGenerator>) -> Arc<dyn LoadGenerator> {
    generator.clone()
}

fn requests() -> Vec<RequestSpec> {
    vec![RequestSpec::get("/a"), RequestSpec::get("/b"), RequestSpec::get("/c")]
}

#[tokio::test]
async fn test_only_first_request_without_parallel() -> Result<()> {
    let generator = FakeGenerator::new("autocannon", Behaviour::Succeed);
    let session = start_load(requests(), vec![dynamic(&generator)], FanoutOptions::default())?;

    let results = session.results().await?;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].url, "/a");
    assert_eq!(generator.seen(), ["/a"]);
    Ok(())
}

#[tokio::test]
async fn test_parallel_runs_every_pair_generator_major() -> Result<()> {
    let first = FakeGenerator::new("autocannon", Behaviour::Succeed);
    let second = FakeGenerator::new("wrk2", Behaviour::Succeed);
    let session = start_load(
        requests(),
        vec![dynamic(&first), dynamic(&second)],
        FanoutOptions { parallel: true },
    )?;

    let results = session.results().await?;
    let order: Vec<(String, String)> = results.iter().map(|r| (r.tool.clone(), r.url.clone())).collect();
    let expected: Vec<(String, String)> = [
        ("autocannon", "/a"),
        ("autocannon", "/b"),
        ("autocannon", "/c"),
        ("wrk2", "/a"),
        ("wrk2", "/b"),
        ("wrk2", "/c"),
    ]
    .iter()
    .map(|(t, u)| (t.to_string(), u.to_string()))
    .collect();
    assert_eq!(order, expected);
    assert_eq!(first.seen().len(), 3);
    assert_eq!(second.seen().len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_absent_generators_are_dropped() -> Result<()> {
    let present = FakeGenerator::new("autocannon", Behaviour::Succeed);
    let absent = FakeGenerator::new("wrk2", Behaviour::Absent);
    let session = start_load(
        vec![RequestSpec::get("/")],
        vec![dynamic(&absent), dynamic(&present)],
        FanoutOptions::default(),
    )?;

    let results = session.results().await?;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].tool, "autocannon");
    assert_eq!(absent.seen(), ["/"]);
    Ok(())
}

#[tokio::test]
async fn test_all_generators_absent() -> Result<()> {
    let session = start_load(
        vec![RequestSpec::get("/")],
        vec![
            dynamic(&FakeGenerator::new("autocannon", Behaviour::Absent)),
            dynamic(&FakeGenerator::new("wrk2", Behaviour::Absent)),
        ],
        FanoutOptions::default(),
    )?;

    match session.results().await {
        Err(ExpfError::NoUsableLoadGenerator(names)) => assert_eq!(names, ["autocannon", "wrk2"]),
        other => panic!("expected NoUsableLoadGenerator, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_hard_failure_fails_the_set() -> Result<()> {
    let session = start_load(
        vec![RequestSpec::get("/")],
        vec![
            dynamic(&FakeGenerator::new("autocannon", Behaviour::Succeed)),
            dynamic(&FakeGenerator::new("wrk2", Behaviour::Fail)),
        ],
        FanoutOptions::default(),
    )?;

    let err = session.results().await.unwrap_err();
    assert!(matches!(err, ExpfError::ToolExecutionFailed { .. }));
    assert_eq!(err.captured_output(), Some(("", "connection refused")));

    // Memoized: a second call reports the same outcome.
    assert!(session.results().await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_invalid_inputs_are_rejected() -> Result<()> {
    let generator = FakeGenerator::new("autocannon", Behaviour::Succeed);

    let empty = start_load(Vec::new(), vec![dynamic(&generator)], FanoutOptions::default());
    assert!(matches!(empty, Err(ExpfError::EmptyRequestSet)));

    let none = start_load(vec![RequestSpec::get("/")], Vec::new(), FanoutOptions::default());
    assert!(matches!(none, Err(ExpfError::NoLoadGenerators)));

    assert!(generator.seen().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_close_reaches_every_generator() -> Result<()> {
    let first = FakeGenerator::new("autocannon", Behaviour::Succeed);
    let second = FakeGenerator::new("wrk2", Behaviour::Absent);
    let session = start_load(
        vec![RequestSpec::get("/")],
        vec![dynamic(&first), dynamic(&second)],
        FanoutOptions::default(),
    )?;

    session.results().await?;
    session.close();
    assert_eq!(first.closed.load(Ordering::SeqCst), 1);
    assert_eq!(second.closed.load(Ordering::SeqCst), 1);
    Ok(())
}

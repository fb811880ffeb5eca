//! Structural invariants that must hold for every generated DAG and every
//! registry selection, regardless of template, mode or tool population.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::Rng;

use skein::dag::{
    DagGenerator, GenerationMode, GenerationRequest, NodeKind, ScoreWeights, TemplateStore,
};
use skein::tools::{ToolCategory, ToolDefinition, ToolRegistry, ToolType};

const TEMPLATES: [&str; 3] = ["basic_conversation", "knowledge_base", "deep_thinking"];
const MODES: [GenerationMode; 4] = [
    GenerationMode::Full,
    GenerationMode::Minimal,
    GenerationMode::Custom,
    GenerationMode::Optimized,
];

async fn populated_registry() -> Arc<ToolRegistry> {
    let registry = ToolRegistry::with_builtins().await;
    let mut rng = rand::thread_rng();
    let categories = [
        ToolCategory::Search,
        ToolCategory::Content,
        ToolCategory::Analysis,
        ToolCategory::Data,
        ToolCategory::Calculation,
    ];
    let types = [ToolType::External, ToolType::Mcp, ToolType::System];
    for i in 0..20 {
        let category = categories[i % categories.len()];
        let tool_type = types[i % types.len()];
        let tool = ToolDefinition::new(
            format!("svc-{}", i % 3),
            format!("tool_{i}"),
            tool_type,
            category,
        )
        .with_stats(rng.gen_range(0.5..1.0), rng.gen_range(10.0..8000.0));
        registry.register(tool).await;
    }
    Arc::new(registry)
}

fn assert_dag_invariants(dag: &skein::dag::GeneratedDag) {
    let context = format!("{} / {}", dag.template_id, dag.mode);

    // Exactly one input, at least one output.
    let inputs = dag
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::Input(_)))
        .count();
    let outputs = dag
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::Output(_)))
        .count();
    assert_eq!(inputs, 1, "{context}: inputs");
    assert!(outputs >= 1, "{context}: outputs");

    // Edges only between existing nodes, and the execution order is a
    // topological order covering every node.
    let ids: HashSet<&str> = dag.nodes.iter().map(|n| n.id.as_str()).collect();
    for edge in &dag.edges {
        assert!(ids.contains(edge.from.as_str()), "{context}: {}", edge.from);
        assert!(ids.contains(edge.to.as_str()), "{context}: {}", edge.to);
    }
    assert_eq!(dag.execution_order.len(), dag.nodes.len(), "{context}");
    let position: HashMap<&str, usize> = dag
        .execution_order
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();
    for edge in &dag.edges {
        assert!(
            position[edge.from.as_str()] < position[edge.to.as_str()],
            "{context}: {} -> {}",
            edge.from,
            edge.to
        );
    }

    // Tool mapping invariants: only selected tools, bounded per node.
    let selected: HashSet<&str> = dag.selected_tools.iter().map(|t| t.id.as_str()).collect();
    for node in dag.nodes.iter().filter(|n| n.is_agent()) {
        let config = node.agent_config().unwrap();
        let mapped = dag
            .tool_mapping
            .get(&node.id)
            .unwrap_or_else(|| panic!("{context}: agent {} unmapped", node.id));
        assert!(mapped.len() <= config.max_tools, "{context}: {}", node.id);
        for tool_id in mapped {
            assert!(selected.contains(tool_id.as_str()), "{context}: {tool_id}");
        }
    }

    assert!(dag.optimization_score >= 0.0 && dag.optimization_score <= 1.0);
    assert!(dag.estimated_cost > 0.0);
    assert!(dag.estimated_time > 0.0);
}

#[tokio::test]
async fn every_template_and_mode_yields_a_valid_dag() {
    let registry = populated_registry().await;
    let generator = DagGenerator::new(
        Arc::new(TemplateStore::new()),
        registry,
        ScoreWeights::default(),
    );

    for template_id in TEMPLATES {
        for mode in MODES {
            let mut request = GenerationRequest::new(template_id, "prop-user");
            request.mode = mode;
            request.preferences.preferred_categories = vec![];
            request.preferences.preferred_types = vec![];

            let dag = generator
                .generate(&request)
                .await
                .unwrap_or_else(|e| panic!("{template_id}/{mode}: {e}"));
            assert_dag_invariants(&dag);
        }
    }
}

#[tokio::test]
async fn selection_is_sorted_and_usable_for_any_filter() {
    let registry = populated_registry().await;
    registry
        .set_tool_availability("svc-0.tool_0", false)
        .await;

    let filters: Vec<(Vec<ToolCategory>, Vec<ToolType>)> = vec![
        (vec![], vec![]),
        (vec![ToolCategory::Search], vec![]),
        (vec![], vec![ToolType::Mcp, ToolType::Builtin]),
        (
            vec![ToolCategory::Analysis, ToolCategory::Data],
            vec![ToolType::External],
        ),
    ];

    for (categories, types) in filters {
        for max_tools in [None, Some(1), Some(5), Some(100)] {
            let selected = registry
                .select_for_agent(&categories, &types, max_tools)
                .await;

            if let Some(max) = max_tools {
                assert!(selected.len() <= max);
            }
            for tool in &selected {
                assert!(tool.usable());
                assert!(categories.is_empty() || categories.contains(&tool.category));
                assert!(types.is_empty() || types.contains(&tool.tool_type));
            }
            for pair in selected.windows(2) {
                let ordered = pair[0].success_rate > pair[1].success_rate
                    || (pair[0].success_rate == pair[1].success_rate
                        && pair[0].avg_response_time <= pair[1].avg_response_time);
                assert!(ordered, "{} before {}", pair[0].id, pair[1].id);
            }
        }
    }
}

#[tokio::test]
async fn regenerating_the_same_request_is_structurally_stable() {
    let registry = populated_registry().await;
    let generator = DagGenerator::new(
        Arc::new(TemplateStore::new()),
        registry,
        ScoreWeights::default(),
    );

    let mut request = GenerationRequest::new("knowledge_base", "prop-user");
    request.preferences.preferred_categories = vec![];
    request.preferences.preferred_types = vec![];

    let first = generator.generate(&request).await.unwrap();
    let second = generator.generate(&request).await.unwrap();

    let node_ids = |dag: &skein::dag::GeneratedDag| -> Vec<String> {
        dag.nodes.iter().map(|n| n.id.clone()).collect()
    };
    assert_eq!(node_ids(&first), node_ids(&second));
    assert_eq!(first.execution_order, second.execution_order);
    assert_eq!(first.tool_mapping, second.tool_mapping);
    assert!((first.optimization_score - second.optimization_score).abs() < f64::EPSILON);
}

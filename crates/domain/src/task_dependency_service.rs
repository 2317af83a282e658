use uuid::Uuid;

use crate::entities::{Job, Task, TaskState};
use crate::value_objects::TaskSpec;

/// 依赖检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyResolution {
    /// 全部依赖成功
    Satisfied,
    /// 仍有依赖未结束
    Pending,
    /// 某个依赖以 Failure 或 Skipped 结束，任务永远无法运行
    Broken,
}

impl DependencyResolution {
    /// 新建任务或依赖变化后应处于的状态
    pub fn task_state(&self) -> TaskState {
        match self {
            DependencyResolution::Satisfied => TaskState::Waiting,
            DependencyResolution::Pending => TaskState::Depend,
            DependencyResolution::Broken => TaskState::Skipped,
        }
    }
}

/// 任务依赖检查
pub struct TaskDependencyService;

impl TaskDependencyService {
    /// 根据依赖任务的当前状态判断依赖是否满足
    ///
    /// 找不到的依赖视为已满足，依赖只能引用已存在的任务。
    pub fn resolve(depends_on: &[Uuid], dependency_states: &[(Uuid, TaskState)]) -> DependencyResolution {
        let mut pending = false;

        for dep_id in depends_on {
            match dependency_states
                .iter()
                .find(|(id, _)| id == dep_id)
                .map(|(_, state)| *state)
            {
                Some(TaskState::Success) | None => {}
                Some(TaskState::Failure) | Some(TaskState::Skipped) => {
                    return DependencyResolution::Broken;
                }
                Some(_) => pending = true,
            }
        }

        if pending {
            DependencyResolution::Pending
        } else {
            DependencyResolution::Satisfied
        }
    }

    pub fn validate(task_id: Uuid, depends_on: &[Uuid]) -> Result<(), String> {
        if depends_on.contains(&task_id) {
            return Err(format!("任务 {task_id} 不能依赖自身"));
        }
        Ok(())
    }

    /// 把任务描述树展开为待创建的任务列表
    ///
    /// 父任务排在子任务之前，每个子任务额外依赖它的直接父任务，
    /// 父任务成功后子任务才能运行。
    pub fn build_tasks(job: &Job, specs: &[TaskSpec]) -> Vec<Task> {
        let mut tasks = Vec::new();
        for spec in specs {
            Self::build_subtree(job, spec, None, &mut tasks);
        }
        tasks
    }

    fn build_subtree(job: &Job, spec: &TaskSpec, parent: Option<Uuid>, out: &mut Vec<Task>) {
        let mut task = Task::new(job, spec);
        if let Some(parent_id) = parent {
            if !task.depends_on.contains(&parent_id) {
                task.depends_on.push(parent_id);
            }
        }
        if task.has_dependencies() {
            task.state = TaskState::Depend;
        }
        let id = task.id;
        out.push(task);

        for child in &spec.children {
            Self::build_subtree(job, child, Some(id), out);
        }
    }
}
